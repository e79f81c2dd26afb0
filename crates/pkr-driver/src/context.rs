//! A loaded kard, as seen by drivers and plugins

use pkr_core::{Environment, Meta, PkrRoot};
use pkr_engine::{KardHelpers, SourceBase};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct KardContext {
    pub root: PkrRoot,
    /// Environment with the kard's features applied
    pub env: Environment,
    pub name: String,
    pub path: PathBuf,
    /// Rendered meta
    pub meta: Meta,
    pub features: Vec<String>,
}

impl KardContext {
    /// Naming and path helpers, shared with templates
    pub fn helpers(&self) -> Result<KardHelpers> {
        let contexts: BTreeMap<String, String> = self
            .env
            .containers()?
            .into_iter()
            .map(|c| {
                let context = c.context_dir().to_string();
                (c.name, context)
            })
            .collect();

        Ok(KardHelpers::new(
            self.env.name.clone(),
            self.name.clone(),
            self.path.clone(),
            self.meta.clone(),
        )
        .with_contexts(contexts))
    }

    pub fn source_base(&self) -> SourceBase {
        let src_path = self
            .meta
            .get_str("src_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.path.join("src"));
        SourceBase {
            pkr_root: self.root.path().to_path_buf(),
            kard_path: self.path.clone(),
            src_path,
        }
    }

    /// `tag` as a string
    pub fn tag(&self) -> Option<String> {
        match self.meta.get("tag")? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// A key under `driver.<section>`
    pub fn driver_setting(&self, section: &str, key: &str) -> Option<&JsonValue> {
        self.meta
            .get(&format!("driver.{section}.{key}"))
            .filter(|v| !v.is_null())
    }
}

//! Kard-aware helper functions for file templates
//!
//! The same helpers are used by drivers to name images and containers, so
//! templates and build commands always agree.

use minijinja::{Environment, Error, ErrorKind};
use pkr_core::Meta;
use pkr_core::environment::DEFAULT_CONTEXT;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Placeholder replaced by the service name in name patterns
pub const SERVICE_PLACEHOLDER: &str = "%SERVICE%";

/// Naming and path helpers bound to one kard
#[derive(Debug, Clone)]
pub struct KardHelpers {
    pub env_name: String,
    pub kard_name: String,
    pub kard_path: PathBuf,
    pub meta: Meta,
    /// Build context directory of each container
    pub contexts: BTreeMap<String, String>,
}

impl KardHelpers {
    pub fn new(
        env_name: impl Into<String>,
        kard_name: impl Into<String>,
        kard_path: impl Into<PathBuf>,
        meta: Meta,
    ) -> Self {
        Self {
            env_name: env_name.into(),
            kard_name: kard_name.into(),
            kard_path: kard_path.into(),
            meta,
            contexts: BTreeMap::new(),
        }
    }

    pub fn with_contexts(mut self, contexts: BTreeMap<String, String>) -> Self {
        self.contexts = contexts;
        self
    }

    fn tag(&self) -> Option<String> {
        match self.meta.get("tag")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// `name:tag`, prefixed with `registry/` when a registry is set
    pub fn format_image(&self, name: &str) -> String {
        let mut image = match self.tag() {
            Some(tag) => format!("{name}:{tag}"),
            None => name.to_string(),
        };
        if let Some(registry) = self.meta.get_str("registry").filter(|r| !r.is_empty()) {
            image = format!("{}/{image}", registry.trim_end_matches('/'));
        }
        image
    }

    /// Kard directory as seen by the deployment
    pub fn kard_path(&self, rel: &str) -> PathBuf {
        let base = self
            .meta
            .get_str("real_kard_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.kard_path.clone());
        join(&base, rel)
    }

    pub fn context_path(&self, rel: &str, container: Option<&str>) -> PathBuf {
        let context = container
            .and_then(|c| self.contexts.get(c))
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTEXT);
        join(&self.kard_path(context), rel)
    }

    pub fn src_path(&self, rel: &str) -> PathBuf {
        let base = self
            .meta
            .get_str("src_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.kard_path.join("src"));
        join(&base, rel)
    }

    pub fn data_path(&self, rel: &str) -> PathBuf {
        let data = self.meta.get_str("data_path").unwrap_or("data");
        let base = if Path::new(data).is_absolute() {
            PathBuf::from(data)
        } else {
            self.kard_path(data)
        };
        join(&base, rel)
    }

    pub fn make_container_name(&self, service: &str) -> String {
        self.meta
            .get_str("container_pattern")
            .unwrap_or(SERVICE_PLACEHOLDER)
            .replace(SERVICE_PLACEHOLDER, service)
    }

    pub fn make_image_name(&self, service: &str, tag: Option<&str>) -> String {
        let name = self
            .meta
            .get_str("image_pattern")
            .unwrap_or(SERVICE_PLACEHOLDER)
            .replace(SERVICE_PLACEHOLDER, service);
        match tag {
            Some(tag) => format!("{name}:{tag}"),
            None => name,
        }
    }

    pub fn kard_file_content(&self, rel: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.kard_path.join(rel))
    }

    /// Register every helper on a MiniJinja environment
    pub fn register(self: &Arc<Self>, env: &mut Environment<'static>) {
        let h = Arc::clone(self);
        env.add_function("format_image", move |name: String| h.format_image(&name));

        let h = Arc::clone(self);
        env.add_function(
            "context_path",
            move |rel: Option<String>, container: Option<String>| {
                display(h.context_path(rel.as_deref().unwrap_or(""), container.as_deref()))
            },
        );

        let h = Arc::clone(self);
        env.add_function("kard_path", move |rel: Option<String>| {
            display(h.kard_path(rel.as_deref().unwrap_or("")))
        });

        let h = Arc::clone(self);
        env.add_function("src_path", move |rel: Option<String>| {
            display(h.src_path(rel.as_deref().unwrap_or("")))
        });

        let h = Arc::clone(self);
        env.add_function("data_path", move |rel: Option<String>| {
            display(h.data_path(rel.as_deref().unwrap_or("")))
        });

        let h = Arc::clone(self);
        env.add_function("make_container_name", move |service: String| {
            h.make_container_name(&service)
        });

        let h = Arc::clone(self);
        env.add_function(
            "make_image_name",
            move |service: String, tag: Option<String>| h.make_image_name(&service, tag.as_deref()),
        );

        let h = Arc::clone(self);
        env.add_function("kard_file_content", move |rel: String| {
            h.kard_file_content(&rel).map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("cannot read kard file '{rel}': {e}"),
                )
            })
        });
    }
}

fn join(base: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() { base.to_path_buf() } else { base.join(rel) }
}

fn display(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

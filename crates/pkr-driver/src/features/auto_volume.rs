//! Mount sources as volumes or bake them into images
//!
//! Dockerfile templates call `add_file(paths)` with a mapping of
//! `common` and `copied` entries (remote path to local path). With
//! `use_volume`, common paths become a `VOLUME` instruction and copied ones
//! are left out; otherwise every entry becomes an `ADD` line.

use minijinja::{Error, ErrorKind, State, Value};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::Plugin;
use crate::context::KardContext;
use crate::error::Result;

const USE_VOLUME: &str = "use_volume";

pub struct AutoVolume;

impl Plugin for AutoVolume {
    fn name(&self) -> &'static str {
        "auto_volume"
    }

    fn description(&self) -> &'static str {
        "add_file() template function, mounting or adding sources per use_volume"
    }

    fn template_data(&self, ctx: &KardContext) -> Result<serde_json::Map<String, JsonValue>> {
        let mut data = serde_json::Map::new();
        data.insert(USE_VOLUME.to_string(), JsonValue::Bool(use_volume(ctx)));
        Ok(data)
    }

    fn register_functions(&self, env: &mut minijinja::Environment<'static>) {
        env.add_function("add_file", add_file);
    }
}

/// Meta `use_volume`, then the environment's, false by default
fn use_volume(ctx: &KardContext) -> bool {
    ctx.meta
        .get(USE_VOLUME)
        .or_else(|| ctx.env.get(USE_VOLUME))
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

fn entries(paths: &JsonValue, key: &str) -> BTreeMap<String, String> {
    paths
        .get(key)
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .map(|(remote, local)| {
                    let local = local
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| local.to_string());
                    (remote.clone(), local)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Usage: {{ add_file({"common": {"/app": "src"}, "copied": {...}}) }}
pub fn add_file(state: &State, paths: Value) -> std::result::Result<String, Error> {
    let paths = serde_json::to_value(&paths)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    let volumes = state.lookup(USE_VOLUME).is_some_and(|v| v.is_true());
    Ok(render_paths(&paths, volumes))
}

fn render_paths(paths: &JsonValue, volumes: bool) -> String {
    let common = entries(paths, "common");
    if volumes {
        if common.is_empty() {
            return String::new();
        }
        let quoted: Vec<String> = common.keys().map(|remote| format!("\"{remote}\"")).collect();
        return format!("VOLUME [{}]", quoted.join(", "));
    }

    let mut all = common;
    all.extend(entries(paths, "copied"));
    all.iter()
        .map(|(remote, local)| format!("ADD \"{local}\" \"{remote}\""))
        .collect::<Vec<_>>()
        .join("\n")
}

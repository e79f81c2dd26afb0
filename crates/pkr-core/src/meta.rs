//! Meta values with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Meta container with deep merge capability
///
/// Objects are kept in sorted key order, so two equal metas always
/// serialize to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(pub JsonValue);

impl Meta {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load meta from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse meta from a YAML string. An empty document is an empty mapping.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self(normalize(value)))
    }

    /// Deep merge `overlay` into this meta
    ///
    /// - Objects: recursive merge
    /// - Everything else, sequences included: overlay replaces base
    pub fn merge(&mut self, overlay: &Meta) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Merge several metas, lowest precedence first
    pub fn merge_all<I: IntoIterator<Item = Meta>>(metas: I) -> Self {
        let mut result = Meta::new();
        for m in metas {
            result.merge(&m);
        }
        result
    }

    /// Set a value by dotted path (e.g. "driver.name")
    pub fn set(&mut self, path: &str, value: JsonValue) {
        let parts: Vec<&str> = path.split('.').collect();
        set_nested(&mut self.0, &parts, value);
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        lookup(&self.0, path)
    }

    /// Get a string value by dotted path
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(JsonValue::as_str)
    }

    /// Whether a dotted path is set to something other than null
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some_and(|v| !v.is_null())
    }

    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }

    /// Report which keys of a `required_meta` definition are missing.
    ///
    /// A definition is a key name, a list of definitions applying at the
    /// same level, or a mapping whose values apply under each key.
    pub fn missing_keys(&self, definition: &JsonValue) -> Vec<String> {
        let mut missing = Vec::new();
        collect_missing(&self.0, definition, "", &mut missing);
        missing
    }
}

impl From<JsonValue> for Meta {
    fn from(value: JsonValue) -> Self {
        Self(normalize(value))
    }
}

/// Deep merge two JSON values, `overlay` winning
pub fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Look up a dotted path inside any JSON value
pub fn lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let parts: Vec<&str> = path.split('.').collect();
    get_nested(value, &parts)
}

fn normalize(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
        other => other,
    }
}

fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }

    if let JsonValue::Object(map) = value {
        if remaining.is_empty() {
            map.insert((*key).to_string(), new_value);
        } else {
            let entry = map
                .entry((*key).to_string())
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            set_nested(entry, remaining, new_value);
        }
    }
}

fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

fn collect_missing(data: &JsonValue, definition: &JsonValue, prefix: &str, out: &mut Vec<String>) {
    match definition {
        JsonValue::String(key) => {
            let present = data.get(key).is_some_and(|v| !v.is_null());
            if !present {
                out.push(format!("{prefix}{key}"));
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                collect_missing(data, item, prefix, out);
            }
        }
        JsonValue::Object(map) => {
            for (key, sub) in map {
                let nested = data.get(key).unwrap_or(&JsonValue::Null);
                collect_missing(nested, sub, &format!("{prefix}{key}."), out);
            }
        }
        _ => {}
    }
}

/// Parse `--extra` arguments (`key=value`)
///
/// Dotted keys nest. `true`/`false` (any case) become booleans; every other
/// value is kept as a string so that tags such as `1.0` survive untouched.
pub fn parse_extra(args: &[String]) -> Result<Meta> {
    let mut meta = Meta::new();

    for arg in args {
        let (key, val) = arg
            .split_once('=')
            .filter(|(k, _)| !k.is_empty())
            .ok_or_else(|| CoreError::InvalidExtra { arg: arg.clone() })?;

        let value = match val.to_ascii_lowercase().as_str() {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            _ => JsonValue::String(val.to_string()),
        };

        meta.set(key, value);
    }

    Ok(meta)
}

//! Ranked meta sources and the store that folds them

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::meta::{Meta, deep_merge, lookup};

/// Where a piece of meta comes from.
///
/// The rank is fixed by the kind; lower rank means higher precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    CliExtra,
    CliMetaFile,
    ExtensionSetup,
    DriverGetMeta,
    FeaturesFile,
    FeaturesImport,
    Environment,
    EnvironmentImport,
}

impl SourceKind {
    pub const ALL: [SourceKind; 8] = [
        SourceKind::CliExtra,
        SourceKind::CliMetaFile,
        SourceKind::ExtensionSetup,
        SourceKind::DriverGetMeta,
        SourceKind::FeaturesFile,
        SourceKind::FeaturesImport,
        SourceKind::Environment,
        SourceKind::EnvironmentImport,
    ];

    pub fn rank(self) -> u8 {
        match self {
            SourceKind::CliExtra => 0,
            SourceKind::CliMetaFile => 1,
            SourceKind::ExtensionSetup => 2,
            SourceKind::DriverGetMeta => 3,
            SourceKind::FeaturesFile => 4,
            SourceKind::FeaturesImport => 5,
            SourceKind::Environment => 6,
            SourceKind::EnvironmentImport => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::CliExtra => "cli-extra",
            SourceKind::CliMetaFile => "cli-meta-file",
            SourceKind::ExtensionSetup => "extension-setup",
            SourceKind::DriverGetMeta => "driver-get-meta",
            SourceKind::FeaturesFile => "features-file",
            SourceKind::FeaturesImport => "features-import",
            SourceKind::Environment => "environment",
            SourceKind::EnvironmentImport => "environment-import",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked origin of meta
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSource {
    pub kind: SourceKind,
    /// File path or plugin name, used in diagnostics
    pub origin: Option<String>,
    pub payload: JsonValue,
}

impl MetaSource {
    pub fn new(kind: SourceKind, payload: impl Into<JsonValue>) -> Self {
        Self {
            kind,
            origin: None,
            payload: payload.into(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Parse a YAML payload, reporting failures against this source
    pub fn from_yaml(kind: SourceKind, origin: impl Into<String>, yaml: &str) -> Result<Self> {
        let origin = origin.into();
        let payload: JsonValue =
            serde_yaml::from_str(yaml).map_err(|e| CoreError::InvalidSource {
                kind,
                rank: kind.rank(),
                origin: origin.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            kind,
            origin: Some(origin),
            payload,
        })
    }

    /// Read and parse a YAML file; anything but a mapping is rejected
    pub fn from_file(kind: SourceKind, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let source = Self::from_yaml(kind, path.display().to_string(), &content)?;
        source.validate()?;
        Ok(source)
    }

    pub fn rank(&self) -> u8 {
        self.kind.rank()
    }

    fn origin_label(&self) -> String {
        self.origin.clone().unwrap_or_else(|| "inline".to_string())
    }

    fn validate(&self) -> Result<()> {
        match &self.payload {
            JsonValue::Object(_) | JsonValue::Null => Ok(()),
            other => Err(CoreError::InvalidSource {
                kind: self.kind,
                rank: self.rank(),
                origin: self.origin_label(),
                message: format!("expected a mapping, found {}", type_name(other)),
            }),
        }
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a sequence",
        JsonValue::Object(_) => "a mapping",
    }
}

/// Collection of ranked sources
///
/// Sources of the same kind keep the order they were pushed in; callers
/// push import chains deepest first.
#[derive(Debug, Clone, Default)]
pub struct MetaStore {
    sources: Vec<MetaSource>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: MetaSource) {
        self.sources.push(source);
    }

    pub fn extend<I: IntoIterator<Item = MetaSource>>(&mut self, sources: I) {
        self.sources.extend(sources);
    }

    /// Drop every source of the given kind
    pub fn remove_kind(&mut self, kind: SourceKind) {
        self.sources.retain(|s| s.kind != kind);
    }

    pub fn sources(&self) -> &[MetaSource] {
        &self.sources
    }

    /// Sources in folding order, lowest precedence first
    pub fn ordered(&self) -> Vec<&MetaSource> {
        let mut ordered: Vec<&MetaSource> = self.sources.iter().collect();
        // stable: same-kind sources keep their push order
        ordered.sort_by_key(|s| std::cmp::Reverse(s.rank()));
        ordered
    }

    /// Fold every source into one mapping
    ///
    /// Every payload is validated before anything is merged, so a bad
    /// source never yields a partial result.
    pub fn resolve(&self) -> Result<Meta> {
        for source in &self.sources {
            source.validate()?;
        }

        let mut merged = JsonValue::Object(serde_json::Map::new());
        for source in self.ordered() {
            if source.payload.is_object() {
                deep_merge(&mut merged, &source.payload);
            }
        }

        tracing::trace!(sources = self.sources.len(), "resolved meta");
        Ok(Meta(merged))
    }

    /// Highest-precedence source defining a dotted key
    pub fn origin_of(&self, path: &str) -> Option<&MetaSource> {
        self.ordered()
            .into_iter()
            .rev()
            .find(|s| lookup(&s.payload, path).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(sources: Vec<MetaSource>) -> MetaStore {
        let mut store = MetaStore::new();
        store.extend(sources);
        store
    }

    #[test]
    fn test_file_errors_name_the_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let broken = dir.path().join("broken.yml");
        std::fs::write(&broken, "a: [1, 2\n  b: :\n").unwrap();
        let message = MetaSource::from_file(SourceKind::CliMetaFile, &broken)
            .unwrap_err()
            .to_string();
        assert!(message.contains("cli-meta-file"), "{message}");
        assert!(message.contains("rank 1"), "{message}");
        assert!(message.contains("broken.yml"), "{message}");

        let list = dir.path().join("list.yml");
        std::fs::write(&list, "- a\n- b\n").unwrap();
        let err = MetaSource::from_file(SourceKind::CliMetaFile, &list).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSource { rank: 1, .. }));

        let good = dir.path().join("good.yml");
        std::fs::write(&good, "owner: ops\n").unwrap();
        let source = MetaSource::from_file(SourceKind::CliMetaFile, &good).unwrap();
        assert_eq!(source.payload, json!({"owner": "ops"}));
    }

    #[test]
    fn test_ranks_are_fixed_and_distinct() {
        let ranks: Vec<u8> = SourceKind::ALL.iter().map(|k| k.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(SourceKind::ExtensionSetup.to_string(), "extension-setup");
    }

    #[test]
    fn test_precedence() {
        let store = store(vec![
            MetaSource::new(SourceKind::CliExtra, json!({"a": 2})),
            MetaSource::new(SourceKind::Environment, json!({"a": 1, "b": 1})),
        ]);
        assert_eq!(store.resolve().unwrap().0, json!({"a": 2, "b": 1}));
    }

    #[test]
    fn test_push_order_does_not_change_precedence() {
        let forward = store(vec![
            MetaSource::new(SourceKind::Environment, json!({"a": 1})),
            MetaSource::new(SourceKind::CliExtra, json!({"a": 2})),
        ]);
        let backward = store(vec![
            MetaSource::new(SourceKind::CliExtra, json!({"a": 2})),
            MetaSource::new(SourceKind::Environment, json!({"a": 1})),
        ]);
        assert_eq!(forward.resolve().unwrap(), backward.resolve().unwrap());
    }

    #[test]
    fn test_deep_merge_across_sources() {
        let store = store(vec![
            MetaSource::new(SourceKind::Environment, json!({"d": {"x": 1, "y": 1}})),
            MetaSource::new(SourceKind::CliExtra, json!({"d": {"y": 2}})),
        ]);
        assert_eq!(store.resolve().unwrap().0, json!({"d": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_sequence_replace_across_sources() {
        let store = store(vec![
            MetaSource::new(SourceKind::Environment, json!({"l": [1, 2]})),
            MetaSource::new(SourceKind::CliExtra, json!({"l": [3]})),
        ]);
        assert_eq!(store.resolve().unwrap().0, json!({"l": [3]}));
    }

    #[test]
    fn test_import_chain_deepest_first() {
        // pushed deepest first: grandparent, then parent
        let store = store(vec![
            MetaSource::new(SourceKind::EnvironmentImport, json!({"v": "grandparent", "g": 1}))
                .with_origin("env/base.yml"),
            MetaSource::new(SourceKind::EnvironmentImport, json!({"v": "parent"}))
                .with_origin("env/common.yml"),
            MetaSource::new(SourceKind::Environment, json!({"own": true})),
        ]);
        let meta = store.resolve().unwrap();
        assert_eq!(meta.get("v").unwrap(), "parent");
        assert_eq!(meta.get("g").unwrap(), 1);
        assert_eq!(meta.get("own").unwrap(), true);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let store = store(vec![
            MetaSource::new(SourceKind::FeaturesFile, json!({"z": {"k": [1, {"n": 2}]}})),
            MetaSource::new(SourceKind::DriverGetMeta, json!({"driver": {"name": "k8s"}})),
            MetaSource::new(SourceKind::ExtensionSetup, json!({"b": "x", "a": "y"})),
            MetaSource::new(SourceKind::CliMetaFile, json!({"z": {"m": null}})),
        ]);
        let first = serde_yaml::to_string(&store.resolve().unwrap()).unwrap();
        let second = serde_yaml::to_string(&store.resolve().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_non_mapping_payload_is_rejected() {
        let store = store(vec![
            MetaSource::new(SourceKind::Environment, json!({"a": 1})),
            MetaSource::new(SourceKind::CliMetaFile, json!(["not", "a", "mapping"]))
                .with_origin("meta.yml"),
        ]);
        let err = store.resolve().unwrap_err();
        match err {
            CoreError::InvalidSource {
                kind, rank, origin, ..
            } => {
                assert_eq!(kind, SourceKind::CliMetaFile);
                assert_eq!(rank, 1);
                assert_eq!(origin, "meta.yml");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unparsable_yaml_names_the_source() {
        let err = MetaSource::from_yaml(SourceKind::CliMetaFile, "meta.yml", "a: [unclosed")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cli-meta-file"));
        assert!(message.contains("rank 1"));
        assert!(message.contains("meta.yml"));
    }

    #[test]
    fn test_origin_of() {
        let store = store(vec![
            MetaSource::new(SourceKind::Environment, json!({"tag": "env"})).with_origin("env.yml"),
            MetaSource::new(SourceKind::CliExtra, json!({"tag": "cli"})),
        ]);
        let origin = store.origin_of("tag").unwrap();
        assert_eq!(origin.kind, SourceKind::CliExtra);
        assert!(store.origin_of("missing").is_none());
    }
}

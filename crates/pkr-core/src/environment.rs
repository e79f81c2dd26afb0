//! Environment definition and loading
//!
//! An environment lives in `env/<name>/env.yml`. It may `import` other
//! files (`env/<import>.yml`), which form a DAG resolved depth-first, and
//! may be extended by feature add-ins (`env/<name>/<feature>.yml`).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::layout::{ENV_FILE, PkrRoot};
use crate::meta::deep_merge;
use crate::source::{MetaSource, SourceKind};

/// Key listing imported files
pub const IMPORT_KEY: &str = "import";

/// Default build context directory of a container
pub const DEFAULT_CONTEXT: &str = "docker-context";

/// Default directory holding templates, relative to the pkr root
pub const DEFAULT_TEMPLATE_DIR: &str = "templates";

/// Copy rule target for one `requires` entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequireSpec {
    pub dst: String,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A `requires` entry with its origin path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequireRule {
    pub origin: String,
    pub dst: String,
    pub exclude: Vec<String>,
}

/// A named unit of templates and build context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerGroup {
    #[serde(skip)]
    pub name: String,

    /// Dockerfile name; containers without one use a prebuilt image
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Build context directory inside the kard
    #[serde(default)]
    pub context: Option<String>,

    /// Build stage
    #[serde(default)]
    pub target: Option<String>,

    /// Container whose definition is merged underneath this one
    #[serde(default)]
    pub parent: Option<String>,

    /// Abstract definition, only usable as a parent
    #[serde(default)]
    pub template: bool,

    #[serde(default)]
    pub requires: BTreeMap<String, RequireSpec>,
}

impl ContainerGroup {
    pub fn context_dir(&self) -> &str {
        self.context.as_deref().unwrap_or(DEFAULT_CONTEXT)
    }

    pub fn require_rules(&self) -> Vec<RequireRule> {
        self.requires
            .iter()
            .map(|(origin, spec)| RequireRule {
                origin: origin.clone(),
                dst: spec.dst.clone(),
                exclude: spec.exclude.clone(),
            })
            .collect()
    }
}

/// Extra file rendered into the kard by the `basic_template` feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraTemplate {
    pub template: String,
    pub dst: String,
}

/// One loaded environment file
#[derive(Debug, Clone)]
struct EnvFile {
    path: PathBuf,
    content: JsonValue,
}

impl EnvFile {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let content: JsonValue =
            serde_yaml::from_str(&raw).map_err(|e| CoreError::InvalidEnvironment {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let content = match content {
            JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
            JsonValue::Object(_) => content,
            _ => {
                return Err(CoreError::InvalidEnvironment {
                    path: path.to_path_buf(),
                    message: "expected a mapping at the top level".to_string(),
                });
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            content,
        })
    }

    fn imports(&self) -> Result<Vec<String>> {
        string_list(&self.content, IMPORT_KEY, &self.path)
    }

    fn default_features(&self) -> Result<Vec<String>> {
        string_list(&self.content, "default_features", &self.path)
    }

    fn meta_source(&self, kind: SourceKind) -> MetaSource {
        let payload = self
            .content
            .get("default_meta")
            .cloned()
            .unwrap_or(JsonValue::Null);
        MetaSource::new(kind, payload).with_origin(self.path.display().to_string())
    }

    /// Content without the import list, ready to be merged
    fn body(&self) -> JsonValue {
        let mut body = self.content.clone();
        if let JsonValue::Object(map) = &mut body {
            map.remove(IMPORT_KEY);
        }
        body
    }
}

fn string_list(content: &JsonValue, key: &str, path: &Path) -> Result<Vec<String>> {
    match content.get(key) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CoreError::InvalidEnvironment {
                        path: path.to_path_buf(),
                        message: format!("'{key}' entries must be strings"),
                    })
            })
            .collect(),
        Some(_) => Err(CoreError::InvalidEnvironment {
            path: path.to_path_buf(),
            message: format!("'{key}' must be a list"),
        }),
    }
}

/// Resolve the import DAG reachable from `file`, depth-first post-order.
///
/// Returned files are deepest first; a file imported twice appears once.
fn resolve_imports(env_dir: &Path, file: &EnvFile) -> Result<Vec<EnvFile>> {
    let mut ordered = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![file.path.display().to_string()];

    for import in file.imports()? {
        visit_import(env_dir, &import, &mut stack, &mut visited, &mut ordered)?;
    }
    Ok(ordered)
}

fn visit_import(
    env_dir: &Path,
    name: &str,
    stack: &mut Vec<String>,
    visited: &mut HashSet<String>,
    ordered: &mut Vec<EnvFile>,
) -> Result<()> {
    if stack.iter().any(|s| s == name) {
        let mut chain: Vec<String> = stack.clone();
        chain.push(name.to_string());
        return Err(CoreError::ImportCycle {
            chain: chain.join(" -> "),
        });
    }
    if !visited.insert(name.to_string()) {
        return Ok(());
    }

    let file = EnvFile::load(&env_dir.join(format!("{name}.yml")))?;

    stack.push(name.to_string());
    for child in file.imports()? {
        visit_import(env_dir, &child, stack, visited, ordered)?;
    }
    stack.pop();

    ordered.push(file);
    Ok(())
}

/// A loaded environment with its ranked meta sources
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,

    /// pkr root the environment belongs to
    pub root: PathBuf,

    /// `env/<name>/`
    pub dir: PathBuf,

    base_document: JsonValue,
    document: JsonValue,
    base_sources: Vec<MetaSource>,
    feature_sources: Vec<MetaSource>,
    import_features: Vec<String>,
    declared_features: Vec<String>,
    applied_features: Vec<String>,
}

impl Environment {
    /// Load `env/<name>/env.yml` and its import chain
    pub fn load(root: &PkrRoot, name: &str) -> Result<Self> {
        let env_dir = root.env_dir();
        let dir = env_dir.join(name);
        let env_path = dir.join(ENV_FILE);

        if !env_path.is_file() {
            return Err(CoreError::EnvironmentNotFound {
                name: name.to_string(),
                path: env_path,
            });
        }

        let main = EnvFile::load(&env_path)?;
        let imports = resolve_imports(&env_dir, &main)?;

        let mut document = JsonValue::Object(serde_json::Map::new());
        let mut base_sources = Vec::new();
        let mut import_features = Vec::new();

        for file in &imports {
            deep_merge(&mut document, &file.body());
            base_sources.push(file.meta_source(SourceKind::EnvironmentImport));
            import_features.extend(file.default_features()?);
        }
        deep_merge(&mut document, &main.body());
        base_sources.push(main.meta_source(SourceKind::Environment));

        tracing::debug!(
            env = name,
            imports = imports.len(),
            "loaded environment"
        );

        Ok(Self {
            name: name.to_string(),
            root: root.path().to_path_buf(),
            dir,
            base_document: document.clone(),
            document,
            base_sources,
            feature_sources: Vec::new(),
            import_features,
            declared_features: main.default_features()?,
            applied_features: Vec::new(),
        })
    }

    /// Features declared by imported files, deepest first
    pub fn import_features(&self) -> &[String] {
        &self.import_features
    }

    /// Features declared by the environment file itself
    pub fn declared_features(&self) -> &[String] {
        &self.declared_features
    }

    /// Features whose add-in files have been merged
    pub fn applied_features(&self) -> &[String] {
        &self.applied_features
    }

    /// Merge the add-in file of each feature that has one
    ///
    /// Replaces any previously applied set; features without a file are
    /// plugin-only and ignored here.
    pub fn apply_features(&mut self, features: &[String]) -> Result<()> {
        let env_dir = self.root.join(crate::layout::ENV_FOLDER);
        let mut document = self.base_document.clone();
        let mut sources = Vec::new();
        let mut applied = Vec::new();

        for feature in features {
            let path = self.dir.join(format!("{feature}.yml"));
            if !path.is_file() {
                continue;
            }
            let file = EnvFile::load(&path)?;
            for import in resolve_imports(&env_dir, &file)? {
                deep_merge(&mut document, &import.body());
                sources.push(import.meta_source(SourceKind::FeaturesImport));
            }
            deep_merge(&mut document, &file.body());
            sources.push(file.meta_source(SourceKind::FeaturesFile));
            applied.push(feature.clone());
        }

        self.document = document;
        self.feature_sources = sources;
        self.applied_features = applied;
        Ok(())
    }

    /// Every meta source contributed by environment files
    pub fn meta_sources(&self) -> Vec<MetaSource> {
        self.base_sources
            .iter()
            .chain(self.feature_sources.iter())
            .cloned()
            .collect()
    }

    /// Top-level key of the merged environment document
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.document.get(key).filter(|v| !v.is_null())
    }

    pub fn document(&self) -> &JsonValue {
        &self.document
    }

    /// `required_meta` definition, empty when absent
    pub fn required_meta(&self) -> JsonValue {
        self.get("required_meta")
            .cloned()
            .unwrap_or(JsonValue::Array(Vec::new()))
    }

    /// Directory holding templates
    pub fn template_dir(&self) -> PathBuf {
        let rel = self
            .get("template_dir")
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_TEMPLATE_DIR);
        self.root.join(rel)
    }

    /// Entries of `templates`
    pub fn extra_templates(&self) -> Result<Vec<ExtraTemplate>> {
        match self.get("templates") {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                CoreError::InvalidEnvironment {
                    path: self.dir.join(ENV_FILE),
                    message: format!("invalid 'templates': {e}"),
                }
            }),
        }
    }

    fn raw_containers(&self) -> Option<&serde_json::Map<String, JsonValue>> {
        self.get("containers").and_then(JsonValue::as_object)
    }

    /// Names of concrete containers, sorted
    pub fn container_names(&self) -> Vec<String> {
        let Some(raw) = self.raw_containers() else {
            return Vec::new();
        };
        raw.iter()
            .filter(|(_, v)| {
                !v.get("template")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// One container with its parent chain merged underneath
    pub fn container(&self, name: &str) -> Result<ContainerGroup> {
        let mut seen = Vec::new();
        let merged = self.merged_container(name, &mut seen)?;
        let mut group: ContainerGroup =
            serde_json::from_value(merged).map_err(|e| CoreError::InvalidEnvironment {
                path: self.dir.join(ENV_FILE),
                message: format!("invalid container '{name}': {e}"),
            })?;
        group.name = name.to_string();
        Ok(group)
    }

    fn merged_container(&self, name: &str, seen: &mut Vec<String>) -> Result<JsonValue> {
        if seen.iter().any(|s| s == name) {
            seen.push(name.to_string());
            return Err(CoreError::InvalidEnvironment {
                path: self.dir.join(ENV_FILE),
                message: format!("container parent cycle: {}", seen.join(" -> ")),
            });
        }
        seen.push(name.to_string());

        let raw = self
            .raw_containers()
            .and_then(|c| c.get(name))
            .ok_or_else(|| CoreError::UnknownContainer {
                name: name.to_string(),
                env: self.name.clone(),
            })?;
        let own = match raw {
            JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
            other => other.clone(),
        };

        match own.get("parent").and_then(JsonValue::as_str) {
            Some(parent) => {
                let mut merged = self.merged_container(parent, seen)?;
                deep_merge(&mut merged, &own);
                // the child decides whether it is abstract
                if let JsonValue::Object(map) = &mut merged {
                    map.insert(
                        "template".to_string(),
                        own.get("template").cloned().unwrap_or(JsonValue::Bool(false)),
                    );
                }
                Ok(merged)
            }
            None => Ok(own),
        }
    }

    /// All concrete containers, sorted by name
    pub fn containers(&self) -> Result<Vec<ContainerGroup>> {
        self.container_names()
            .iter()
            .map(|name| self.container(name))
            .collect()
    }

    /// Distinct copy rules of the given containers (all when `None`)
    pub fn requires(&self, names: Option<&[String]>) -> Result<Vec<RequireRule>> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.container_names(),
        };
        let mut rules = BTreeSet::new();
        for name in &names {
            rules.extend(self.container(name)?.require_rules());
        }
        Ok(rules.into_iter().collect())
    }
}

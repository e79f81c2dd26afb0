//! Features and the plugins behind them
//!
//! A feature is a name. The environment may carry a `<feature>.yml` add-in
//! for it, and the registry may hold a plugin of the same name whose hooks
//! run at fixed points of the kard lifecycle. Features with neither are
//! accepted and persisted as requested.

pub mod auto_volume;
pub mod basic_template;
pub mod git;

use indexmap::IndexMap;
use pkr_core::{Environment, Meta, MetaSource, SourceKind};
use pkr_engine::{FileRenderer, FunctionRegistrar, RenderContext};
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::context::KardContext;
use crate::error::{DriverError, Result};

/// Where a requested feature comes from, lowest precedence first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureOrigin {
    Import,
    Environment,
    MetaFile,
    Cli,
}

impl fmt::Display for FeatureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureOrigin::Import => "import",
            FeatureOrigin::Environment => "environment",
            FeatureOrigin::MetaFile => "meta-file",
            FeatureOrigin::Cli => "cli",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub origin: FeatureOrigin,
}

/// Application order of the requested features
///
/// On a name collision the later request wins, moving the feature to its
/// position and origin.
pub fn resolve_features(
    import: &[String],
    environment: &[String],
    meta_file: &[String],
    cli: &[String],
) -> Vec<Feature> {
    let mut features: Vec<Feature> = Vec::new();
    let layers = [
        (FeatureOrigin::Import, import),
        (FeatureOrigin::Environment, environment),
        (FeatureOrigin::MetaFile, meta_file),
        (FeatureOrigin::Cli, cli),
    ];
    for (origin, names) in layers {
        for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            features.retain(|f| f.name != name);
            features.push(Feature {
                name: name.to_string(),
                origin,
            });
        }
    }
    features
}

/// `a,b` or a YAML list
pub fn parse_feature_list(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(s) => split_features(s),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .flat_map(split_features)
            .collect(),
        _ => Vec::new(),
    }
}

pub fn split_features(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// What `setup` and `get_meta` see while a kard is being resolved
#[derive(Debug, Clone, Copy)]
pub struct SetupContext<'a> {
    pub kard_name: &'a str,
    pub kard_path: &'a Path,
    pub env: &'a Environment,
    /// Meta resolved so far
    pub meta: &'a Meta,
    /// `--extra` overrides
    pub extra: &'a Meta,
}

/// Hooks a feature can implement; all default to doing nothing
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Side effects at resolution time
    fn setup(&self, _ctx: &SetupContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Meta contributed as an `extension-setup` source
    fn get_meta(&self, _ctx: &SetupContext<'_>) -> Result<JsonValue> {
        Ok(JsonValue::Object(serde_json::Map::new()))
    }

    /// Extra globals of file templates
    fn template_data(&self, _ctx: &KardContext) -> Result<serde_json::Map<String, JsonValue>> {
        Ok(serde_json::Map::new())
    }

    /// Extra template functions
    fn register_functions(&self, _env: &mut minijinja::Environment<'static>) {}

    /// Runs after the driver rendered the kard
    fn populate_kard(&self, _ctx: &KardContext, _renderer: &FileRenderer) -> Result<()> {
        Ok(())
    }

    /// Runs after a successful `up`
    fn post_up(&self, _ctx: &KardContext, _services: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Plugins by feature name
#[derive(Clone, Default)]
pub struct Registry {
    plugins: IndexMap<String, Arc<dyn Plugin>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.keys()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `git`, `auto_volume` and `basic_template`
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(git::Git));
        registry.register(Arc::new(auto_volume::AutoVolume));
        registry.register(Arc::new(basic_template::BasicTemplate));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// Registered plugins, in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Plugin>)> {
        self.plugins.iter().map(|(name, plugin)| (name.as_str(), plugin))
    }

    /// Plugins of `features`, in feature order
    fn active<'a>(
        &'a self,
        features: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a Arc<dyn Plugin>)> + 'a {
        features
            .iter()
            .filter_map(|name| self.plugins.get(name).map(|p| (name.as_str(), p)))
    }

    /// Run `setup` then `get_meta` of each plugin
    ///
    /// The first failure aborts.
    pub fn setup_sources(
        &self,
        features: &[String],
        ctx: &SetupContext<'_>,
    ) -> Result<Vec<MetaSource>> {
        let mut sources = Vec::new();
        for (name, plugin) in self.active(features) {
            tracing::debug!(feature = name, "running setup");
            plugin
                .setup(ctx)
                .map_err(|e| DriverError::plugin(name, "setup", e))?;
            let payload = plugin
                .get_meta(ctx)
                .map_err(|e| DriverError::plugin(name, "get_meta", e))?;
            sources.push(MetaSource::new(SourceKind::ExtensionSetup, payload).with_origin(name));
        }
        Ok(sources)
    }

    /// Add plugin globals and functions to a render context
    pub fn extend_render_context(
        &self,
        features: &[String],
        ctx: &KardContext,
        render: &mut RenderContext,
    ) -> Result<()> {
        for (name, plugin) in self.active(features) {
            let data = plugin
                .template_data(ctx)
                .map_err(|e| DriverError::plugin(name, "template_data", e))?;
            for (key, value) in data {
                render.insert_global(key, value);
            }

            let plugin = Arc::clone(plugin);
            let registrar: FunctionRegistrar =
                Arc::new(move |env: &mut minijinja::Environment<'static>| {
                    plugin.register_functions(env)
                });
            render.add_registrar(registrar);
        }
        Ok(())
    }

    pub fn populate_kard(
        &self,
        features: &[String],
        ctx: &KardContext,
        renderer: &FileRenderer,
    ) -> Result<()> {
        for (name, plugin) in self.active(features) {
            plugin
                .populate_kard(ctx, renderer)
                .map_err(|e| DriverError::plugin(name, "populate_kard", e))?;
        }
        Ok(())
    }

    pub fn post_up(&self, features: &[String], ctx: &KardContext, services: &[String]) -> Result<()> {
        for (name, plugin) in self.active(features) {
            plugin
                .post_up(ctx, services)
                .map_err(|e| DriverError::plugin(name, "post_up", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_later_request_wins() {
        let features = resolve_features(
            &names(&["base", "debug"]),
            &names(&["debug", "monitoring"]),
            &names(&["tls"]),
            &names(&["base"]),
        );
        let order: Vec<(&str, FeatureOrigin)> =
            features.iter().map(|f| (f.name.as_str(), f.origin)).collect();
        assert_eq!(
            order,
            vec![
                ("debug", FeatureOrigin::Environment),
                ("monitoring", FeatureOrigin::Environment),
                ("tls", FeatureOrigin::MetaFile),
                ("base", FeatureOrigin::Cli),
            ]
        );
    }

    #[test]
    fn test_parse_feature_list() {
        assert_eq!(parse_feature_list(&json!("a, b,,c")), names(&["a", "b", "c"]));
        assert_eq!(parse_feature_list(&json!(["a", "b,c"])), names(&["a", "b", "c"]));
        assert!(parse_feature_list(&json!(null)).is_empty());
    }

    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn setup(&self, ctx: &SetupContext<'_>) -> Result<()> {
            self.calls.lock().unwrap().push(format!("setup {}", ctx.kard_name));
            match self.fail_on {
                Some("setup") => Err(DriverError::InvalidConfig("broken".into())),
                _ => Ok(()),
            }
        }

        fn get_meta(&self, ctx: &SetupContext<'_>) -> Result<JsonValue> {
            self.calls.lock().unwrap().push("get_meta".to_string());
            Ok(json!({"recorded": ctx.meta.get("tag").cloned()}))
        }
    }

    fn setup_fixture() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::TempDir::new().unwrap();
        let env_dir = dir.path().join("env/dev");
        std::fs::create_dir_all(&env_dir).unwrap();
        std::fs::write(env_dir.join("env.yml"), "default_meta: {}\n").unwrap();
        let env = Environment::load(&pkr_core::PkrRoot::at(dir.path()), "dev").unwrap();
        (dir, env)
    }

    #[test]
    fn test_setup_sources() {
        let (dir, env) = setup_fixture();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let mut registry = Registry::new();
        registry.register(recorder.clone());

        let meta = Meta::from(json!({"tag": "1"}));
        let extra = Meta::new();
        let ctx = SetupContext {
            kard_name: "demo",
            kard_path: dir.path(),
            env: &env,
            meta: &meta,
            extra: &extra,
        };

        let sources = registry
            .setup_sources(&names(&["unplugged", "recorder"]), &ctx)
            .unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].kind, SourceKind::ExtensionSetup);
        assert_eq!(sources[0].payload, json!({"recorded": "1"}));
        assert_eq!(*recorder.calls.lock().unwrap(), names(&["setup demo", "get_meta"]));
    }

    #[test]
    fn test_plugin_failure_names_hook() {
        let (dir, env) = setup_fixture();
        let mut registry = Registry::new();
        registry.register(Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            fail_on: Some("setup"),
        }));

        let meta = Meta::new();
        let ctx = SetupContext {
            kard_name: "demo",
            kard_path: dir.path(),
            env: &env,
            meta: &meta,
            extra: &meta,
        };
        let err = registry
            .setup_sources(&names(&["recorder"]), &ctx)
            .unwrap_err();
        match err {
            DriverError::Plugin { plugin, hook, .. } => {
                assert_eq!(plugin, "recorder");
                assert_eq!(hook, "setup");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = Registry::builtin();
        let listed: Vec<&str> = registry.iter().map(|(name, _)| name).collect();
        assert_eq!(listed, vec!["git", "auto_volume", "basic_template"]);
        assert!(registry.get("git").is_some());
        assert!(registry.get("nope").is_none());
    }
}

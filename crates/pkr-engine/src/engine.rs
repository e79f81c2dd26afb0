//! Template engine based on MiniJinja
//!
//! Two environments are built from the same filters:
//! - the meta environment renders string leaves of the resolved meta
//! - the file environment renders template files, with the kard helpers,
//!   plugin globals and plugin functions available

use minijinja::{Environment, UndefinedBehavior};
use once_cell::sync::Lazy;
use pkr_core::Meta;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;
use crate::functions::KardHelpers;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{\{.*?\}\}|\{%.*?%\}").expect("valid regex"));

/// Marker a rendered meta string uses to become structured data
const YAML_DOCUMENT_MARKER: &str = "---\n";

/// Callback adding functions to the file environment
pub type FunctionRegistrar = Arc<dyn Fn(&mut Environment<'static>) + Send + Sync>;

/// Whether a string contains template syntax at all
pub fn has_template_markers(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

#[derive(Default)]
pub struct EngineBuilder {
    registrars: Vec<FunctionRegistrar>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add functions to every file environment
    pub fn register<F>(mut self, registrar: F) -> Self
    where
        F: Fn(&mut Environment<'static>) + Send + Sync + 'static,
    {
        self.registrars.push(Arc::new(registrar));
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            registrars: self.registrars,
        }
    }
}

/// The template engine
#[derive(Default, Clone)]
pub struct Engine {
    registrars: Vec<FunctionRegistrar>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registrars", &self.registrars.len())
            .finish()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn base_environment() -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        filters::register(&mut env);
        env
    }

    /// Render every templated string of the meta against itself
    ///
    /// Pass A renders against the resolved meta, pass B renders the pass A
    /// result against itself. A value still holding a placeholder after
    /// pass B is an unstable reference.
    pub fn render_meta(&self, meta: &Meta) -> Result<Meta> {
        let env = Self::base_environment();

        let pass_a = render_leaves(&env, meta.inner(), meta.inner(), "")?;
        let pass_b = render_leaves(&env, &pass_a, &pass_a, "")?;

        if let Some((key, value, placeholder)) = find_unresolved(&pass_b, "") {
            return Err(TemplateError::unstable(&key, &value, &placeholder).into());
        }

        tracing::debug!("rendered meta");
        Ok(Meta::from(pass_b))
    }

    /// Build a renderer for template files
    pub fn file_renderer(&self, ctx: &RenderContext) -> FileRenderer {
        let mut env = Self::base_environment();
        if let Some(dir) = &ctx.template_dir {
            env.set_loader(minijinja::path_loader(dir));
        }

        ctx.helpers.register(&mut env);
        for registrar in &self.registrars {
            registrar(&mut env);
        }
        for registrar in &ctx.registrars {
            registrar(&mut env);
        }

        FileRenderer {
            env,
            context: ctx.to_value(),
        }
    }
}

/// Everything a template file can see
#[derive(Clone)]
pub struct RenderContext {
    pub helpers: Arc<KardHelpers>,

    /// Extra globals, contributed by plugins
    pub globals: serde_json::Map<String, JsonValue>,

    /// Directory used to resolve `{% include %}`
    pub template_dir: Option<PathBuf>,

    /// Plugin functions specific to this kard
    pub registrars: Vec<FunctionRegistrar>,
}

impl RenderContext {
    pub fn new(helpers: KardHelpers) -> Self {
        Self {
            helpers: Arc::new(helpers),
            globals: serde_json::Map::new(),
            template_dir: None,
            registrars: Vec::new(),
        }
    }

    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(dir.into());
        self
    }

    pub fn insert_global(&mut self, key: impl Into<String>, value: JsonValue) {
        self.globals.insert(key.into(), value);
    }

    pub fn add_registrar(&mut self, registrar: FunctionRegistrar) {
        self.registrars.push(registrar);
    }

    /// Meta keys, then `env` and `kard_name`, then plugin globals
    fn to_value(&self) -> JsonValue {
        let mut root = match self.helpers.meta.inner() {
            JsonValue::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        root.insert(
            "env".to_string(),
            JsonValue::String(self.helpers.env_name.clone()),
        );
        root.insert(
            "kard_name".to_string(),
            JsonValue::String(self.helpers.kard_name.clone()),
        );
        for (key, value) in &self.globals {
            root.insert(key.clone(), value.clone());
        }
        JsonValue::Object(root)
    }
}

/// File environment bound to one render context
pub struct FileRenderer {
    env: Environment<'static>,
    context: JsonValue,
}

impl FileRenderer {
    pub fn context(&self) -> &JsonValue {
        &self.context
    }

    pub fn render_str(&self, name: &str, source: &str) -> Result<String> {
        self.env
            .render_named_str(name, source, &self.context)
            .map_err(|e| TemplateError::from_minijinja(e, name, source, Some(&self.context)).into())
    }

    pub fn render_file(&self, path: &Path) -> Result<String> {
        let source = std::fs::read_to_string(path).map_err(|source| EngineError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.render_str(&path.display().to_string(), &source)
    }
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn render_leaves(
    env: &Environment<'static>,
    value: &JsonValue,
    context: &JsonValue,
    path: &str,
) -> Result<JsonValue> {
    match value {
        JsonValue::String(s) if has_template_markers(s) => {
            let name = format!("meta:{path}");
            let rendered = env
                .render_named_str(&name, s, context)
                .map_err(|e| TemplateError::from_minijinja(e, &name, s, Some(context)))?;

            if rendered.starts_with(YAML_DOCUMENT_MARKER) {
                let parsed: JsonValue = serde_yaml::from_str(&rendered).map_err(|e| {
                    TemplateError::simple(&name, format!("rendered value is not valid YAML: {e}"))
                })?;
                Ok(parsed)
            } else {
                Ok(JsonValue::String(rendered))
            }
        }
        JsonValue::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| render_leaves(env, item, context, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(
                    key.clone(),
                    render_leaves(env, item, context, &child_path(path, key))?,
                );
            }
            Ok(JsonValue::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// First string leaf, in key order, still holding a placeholder
fn find_unresolved(value: &JsonValue, path: &str) -> Option<(String, String, String)> {
    match value {
        JsonValue::String(s) => PLACEHOLDER
            .find(s)
            .map(|m| (path.to_string(), s.clone(), m.as_str().to_string())),
        JsonValue::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| find_unresolved(item, &format!("{path}[{i}]"))),
        JsonValue::Object(map) => map
            .iter()
            .find_map(|(key, item)| find_unresolved(item, &child_path(path, key))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateErrorKind;
    use serde_json::json;

    fn render(meta: JsonValue) -> Result<Meta> {
        Engine::new().render_meta(&Meta::from(meta))
    }

    fn template_kind(result: Result<Meta>) -> TemplateErrorKind {
        match result {
            Err(EngineError::Template(e)) => e.kind(),
            other => panic!("expected a template error, got {other:?}"),
        }
    }

    #[test]
    fn test_two_pass_substitution() {
        let meta = render(json!({
            "domain": "example.org",
            "deployment_url": "https://{{ domain }}",
            "service_name": {"get_url": "{{ deployment_url }}/api"}
        }))
        .unwrap();

        assert_eq!(
            meta.get_str("service_name.get_url"),
            Some("https://example.org/api")
        );
        assert_eq!(meta.get_str("deployment_url"), Some("https://example.org"));
    }

    #[test]
    fn test_untemplated_strings_are_untouched() {
        let meta = render(json!({
            "a": "  spaces and } braces {  \n",
            "n": 3,
            "l": ["x", {"y": "{{ a }}"}]
        }))
        .unwrap();

        assert_eq!(meta.get_str("a"), Some("  spaces and } braces {  \n"));
        assert_eq!(meta.get("n").unwrap(), 3);
        assert_eq!(meta.inner()["l"][1]["y"], json!("  spaces and } braces {  \n"));
    }

    #[test]
    fn test_self_reference_is_unstable() {
        let err = render(json!({"a": "{{ a }}"})).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("meta:a"), "{message}");
        assert!(message.contains("{{ a }}"), "{message}");
    }

    #[test]
    fn test_two_hop_cycle_is_unstable() {
        let result = render(json!({"a": "{{ b }}", "b": "{{ a }}"}));
        assert_eq!(template_kind(result), TemplateErrorKind::UnstableReference);
    }

    #[test]
    fn test_chain_too_deep_is_unstable() {
        // a -> b -> c -> d -> e needs three extra passes
        let result = render(json!({
            "a": "{{ b }}",
            "b": "{{ c }}",
            "c": "{{ d }}",
            "d": "{{ e }}",
            "e": "end"
        }));
        assert_eq!(template_kind(result), TemplateErrorKind::UnstableReference);
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let err = render(json!({"url": "{{ deployment_ur }}", "deployment_url": "x"}))
            .unwrap_err();
        match err {
            EngineError::Template(e) => {
                assert_eq!(e.kind(), TemplateErrorKind::UndefinedVariable);
                assert_eq!(e.name, "meta:url");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_yaml_document_becomes_structure() {
        let meta = render(json!({
            "port": 8080,
            "ports": "---\n- {{ port }}\n- 443\n"
        }))
        .unwrap();
        assert_eq!(meta.inner()["ports"], json!([8080, 443]));
    }

    #[test]
    fn test_filters_in_meta() {
        let meta = render(json!({"secret": "pkr", "encoded": "{{ secret | b64encode }}"}))
            .unwrap();
        assert_eq!(meta.get_str("encoded"), Some("cGty"));
    }

    #[test]
    fn test_file_renderer() {
        let meta = Meta::from(json!({
            "tag": "1.0",
            "deployment_url": "https://example.org",
            "service_name": {"get_url": "https://example.org/api"}
        }));
        let helpers = KardHelpers::new("dev", "demo", "/pkr/kard/demo", meta);
        let mut ctx = RenderContext::new(helpers);
        ctx.insert_global("use_volume", json!(true));

        let engine = Engine::builder()
            .register(|env| env.add_function("shout", |s: String| s.to_uppercase()))
            .build();
        let renderer = engine.file_renderer(&ctx);

        let out = renderer
            .render_str(
                "app.conf",
                "url={{ service_name.get_url }}\nimage={{ format_image('api') }}\nenv={{ env }}/{{ kard_name }}\nvol={{ use_volume }}\n{{ shout('x') }}\n",
            )
            .unwrap();
        assert_eq!(
            out,
            "url=https://example.org/api\nimage=api:1.0\nenv=dev/demo\nvol=true\nX\n"
        );
    }

    #[test]
    fn test_file_renderer_suggests_names() {
        let meta = Meta::from(json!({"project_name": "demo"}));
        let ctx = RenderContext::new(KardHelpers::new("dev", "demo", "/k", meta));
        let renderer = Engine::new().file_renderer(&ctx);

        let err = renderer
            .render_str("compose.yml", "name: {{ project_nam }}\n")
            .unwrap_err();
        match err {
            EngineError::Template(e) => {
                assert_eq!(e.kind(), TemplateErrorKind::UndefinedVariable);
                assert_eq!(
                    e.suggestion.as_deref(),
                    Some("Did you mean `project_name`?")
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

//! Compose backend: `docker-compose.yml` rendering and deployment

use pkr_engine::{FileRenderer, RenderPlan};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use super::{BuildOptions, DeployAction, DeployReport, Driver, docker};
use crate::command::Invocation;
use crate::context::KardContext;
use crate::error::{DriverError, Result};

/// Rendered compose document, at the kard root
pub const COMPOSE_FILE: &str = "docker-compose.yml";

const DEFAULT_COMPOSE_BIN: &str = "docker compose";

/// Kard name reduced to what compose accepts as a project name
pub fn project_name(kard: &str) -> String {
    kard.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

fn setting_str<'a>(ctx: &'a KardContext, key: &str) -> Option<&'a str> {
    ctx.driver_setting("docker_compose", key)
        .and_then(JsonValue::as_str)
}

/// Compose file followed by the extension files, all relative to the pkr root
fn compose_sources(ctx: &KardContext) -> Option<Vec<String>> {
    let main = setting_str(ctx, "compose_file")?;
    let mut files = vec![main.to_string()];
    if let Some(JsonValue::Array(extensions)) =
        ctx.driver_setting("docker_compose", "compose_extension_files")
    {
        files.extend(extensions.iter().filter_map(|v| v.as_str().map(str::to_string)));
    }
    Some(files)
}

/// Render and merge the compose sources, `None` when none is configured
pub fn render_document(ctx: &KardContext, renderer: &FileRenderer) -> Result<Option<JsonValue>> {
    let Some(files) = compose_sources(ctx) else {
        return Ok(None);
    };

    let mut document = JsonValue::Object(serde_json::Map::new());
    for file in files {
        let rendered = renderer.render_file(&ctx.root.resolve(&file))?;
        let parsed: JsonValue = serde_yaml::from_str(&rendered)?;
        if !parsed.is_null() {
            merge_documents(&mut document, parsed);
        }
    }
    Ok(Some(document))
}

/// Merge a compose document into another
///
/// Mappings merge recursively and scalars are replaced. Sequences are
/// concatenated, dropping repeated scalars, so an extension file adds
/// `ports` or `volumes` to a service instead of replacing them.
pub fn merge_documents(base: &mut JsonValue, overlay: JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base), JsonValue::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_documents(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (JsonValue::Array(base), JsonValue::Array(overlay)) => {
            let scalars = base
                .iter()
                .chain(overlay.iter())
                .all(|v| !v.is_object() && !v.is_array());
            for value in overlay {
                if !scalars || !base.contains(&value) {
                    base.push(value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub fn plan(ctx: &KardContext, renderer: &FileRenderer) -> Result<RenderPlan> {
    let mut plan = docker::plan(ctx, renderer)?;
    match render_document(ctx, renderer)? {
        Some(document) => {
            let yaml = serde_yaml::to_string(&document)?;
            plan.add(COMPOSE_FILE, yaml.into_bytes(), None)?;
        }
        None => tracing::warn!(
            kard = %ctx.name,
            "no compose file provided by this environment (driver.docker_compose.compose_file)"
        ),
    }
    Ok(plan)
}

/// The rendered document of a made kard
pub fn load_document(ctx: &KardContext) -> Result<JsonValue> {
    let path = ctx.path.join(COMPOSE_FILE);
    if !path.is_file() {
        return Err(DriverError::InvalidConfig(format!(
            "{} does not exist, run `pkr kard make` first",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn service_names(document: &JsonValue) -> Vec<String> {
    document
        .get("services")
        .and_then(JsonValue::as_object)
        .map(|services| services.keys().cloned().collect())
        .unwrap_or_default()
}

fn depends_on(document: &JsonValue, service: &str) -> Vec<String> {
    let deps = document
        .get("services")
        .and_then(|s| s.get(service))
        .and_then(|s| s.get("depends_on"));
    match deps {
        Some(JsonValue::Array(list)) => list
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(JsonValue::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Requested services that exist, dependencies first
///
/// No request selects every service. Names containing `*` are regular
/// expressions matched from the start of the service name. Unknown names
/// are dropped with a warning.
pub fn resolve_services(document: &JsonValue, requested: &[String]) -> Result<Vec<String>> {
    let all = service_names(document);
    if requested.is_empty() {
        return order_services(document, &all);
    }

    let mut selected: Vec<String> = Vec::new();
    for name in requested {
        if name.contains('*') {
            let pattern = Regex::new(&format!("^(?:{name})")).map_err(|e| {
                DriverError::InvalidConfig(format!("invalid service pattern '{name}': {e}"))
            })?;
            for service in all.iter().filter(|s| pattern.is_match(s)) {
                if !selected.contains(service) {
                    selected.push(service.clone());
                }
            }
        } else if all.contains(name) {
            if !selected.contains(name) {
                selected.push(name.clone());
            }
        } else {
            tracing::warn!(service = %name, "unknown service, ignored");
        }
    }

    if selected.is_empty() {
        return Err(DriverError::InvalidConfig(format!(
            "no service matches {}",
            requested.join(", ")
        )));
    }
    order_services(document, &selected)
}

/// Topological order of `selected` along `depends_on`
pub fn order_services(document: &JsonValue, selected: &[String]) -> Result<Vec<String>> {
    let mut ordered = Vec::new();
    let mut done = HashSet::new();
    let mut stack = Vec::new();
    for service in selected {
        visit(document, service, selected, &mut done, &mut stack, &mut ordered)?;
    }
    Ok(ordered)
}

fn visit(
    document: &JsonValue,
    service: &str,
    selected: &[String],
    done: &mut HashSet<String>,
    stack: &mut Vec<String>,
    ordered: &mut Vec<String>,
) -> Result<()> {
    if done.contains(service) {
        return Ok(());
    }
    if let Some(pos) = stack.iter().position(|s| s == service) {
        let mut chain = stack[pos..].to_vec();
        chain.push(service.to_string());
        return Err(DriverError::DependencyCycle {
            chain: chain.join(" -> "),
        });
    }

    stack.push(service.to_string());
    for dep in depends_on(document, service) {
        visit(document, &dep, selected, done, stack, ordered)?;
    }
    stack.pop();

    done.insert(service.to_string());
    if selected.iter().any(|s| s == service) {
        ordered.push(service.to_string());
    }
    Ok(())
}

/// `<compose_bin> -f <kard>/docker-compose.yml -p <project> <args>`
fn invocation<I, S>(ctx: &KardContext, args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let bin = setting_str(ctx, "compose_bin").unwrap_or(DEFAULT_COMPOSE_BIN);
    let mut parts = bin.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        DriverError::InvalidConfig("driver.docker_compose.compose_bin is empty".into())
    })?;
    let project = ctx
        .meta
        .get_str("project_name")
        .map(str::to_string)
        .unwrap_or_else(|| project_name(&ctx.name));

    Ok(Invocation::new(program)
        .args(parts)
        .arg("-f")
        .arg(ctx.path.join(COMPOSE_FILE).to_string_lossy())
        .args(["-p", project.as_str()])
        .args(args))
}

pub async fn deploy(
    driver: &Driver,
    ctx: &KardContext,
    action: DeployAction,
    services: &[String],
) -> Result<DeployReport> {
    let document = load_document(ctx)?;
    let ordered = resolve_services(&document, services)?;
    let mut report = DeployReport::default();

    match action {
        DeployAction::Start => {
            let buildable: Vec<String> = ordered
                .iter()
                .filter(|s| {
                    ctx.env
                        .container(s)
                        .is_ok_and(|c| c.dockerfile.is_some())
                })
                .cloned()
                .collect();
            if !buildable.is_empty() {
                let build = driver.build(ctx, &buildable, &BuildOptions::default()).await?;
                report.build = Some(build);
            }

            tracing::info!(services = ?ordered, "starting services");
            let args = ["up".to_string(), "-d".to_string()]
                .into_iter()
                .chain(ordered.iter().cloned());
            driver.exec(ctx, &invocation(ctx, args)?).await?;
            report.services = ordered;
        }
        DeployAction::Stop => {
            let mut reversed = ordered;
            reversed.reverse();
            tracing::info!(services = ?reversed, "stopping services");
            let args = std::iter::once("stop".to_string()).chain(reversed.iter().cloned());
            driver.exec(ctx, &invocation(ctx, args)?).await?;
            report.services = reversed;
        }
    }
    Ok(report)
}

pub async fn restart(driver: &Driver, ctx: &KardContext, services: &[String]) -> Result<()> {
    let document = load_document(ctx)?;
    let ordered = resolve_services(&document, services)?;
    let args = std::iter::once("restart".to_string()).chain(ordered);
    driver.exec(ctx, &invocation(ctx, args)?).await?;
    Ok(())
}

pub async fn clean(driver: &Driver, ctx: &KardContext, kill: bool) -> Result<()> {
    if kill {
        driver.exec(ctx, &invocation(ctx, ["kill"])?).await?;
    }
    driver.exec(ctx, &invocation(ctx, ["down", "-v"])?).await?;
    Ok(())
}

pub async fn ps(driver: &Driver, ctx: &KardContext) -> Result<Vec<String>> {
    let output = driver.query(&invocation(ctx, ["ps"])?).await?;
    Ok(output.stdout.lines().map(str::to_string).collect())
}

//! Kubernetes backend: manifests under `k8s/`, applied with kubectl
//!
//! What was applied is remembered in the cluster (see [`crate::cluster`]),
//! which lets a new deployment show its diff and delete manifests that
//! disappeared since the previous one.

use pkr_core::kard::META_FILE;
use pkr_engine::{CopyRule, FileRenderer, RenderPlan};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

use super::{DeployAction, DeployReport, Driver, docker};
use crate::cluster::DeployedFiles;
use crate::command::Invocation;
use crate::context::KardContext;
use crate::diff;
use crate::error::Result;

/// Output subfolder of rendered manifests
pub const K8S_DIR: &str = "k8s";

const DEFAULT_NAMESPACE: &str = "default";

const MANIFEST_EXTENSION: &str = "yml";

pub fn plan(ctx: &KardContext, renderer: &FileRenderer) -> Result<RenderPlan> {
    let mut plan = docker::plan(ctx, renderer)?;
    plan.manage(K8S_DIR);

    let base = ctx.source_base();
    let Some(JsonValue::Array(files)) = ctx.driver_setting("k8s", "k8s_files") else {
        return Ok(plan);
    };

    for file in files.iter().filter_map(JsonValue::as_str) {
        let path = ctx.root.resolve(file);
        // directories are flattened into k8s/
        let dst = if path.is_dir() {
            String::new()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let rule = CopyRule::render(path.to_string_lossy(), dst);
        plan.add_rule(Path::new(K8S_DIR), &rule, &base, Some(renderer))?;
    }
    Ok(plan)
}

/// `k8s/*.yml`, sorted by name
fn manifests(ctx: &KardContext) -> Result<Vec<(String, PathBuf)>> {
    let dir = ctx.path.join(K8S_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == MANIFEST_EXTENSION) {
            if let Some(name) = path.file_name() {
                found.push((name.to_string_lossy().into_owned(), path));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Selection by manifest name without extension; none selects all
fn is_selected(name: &str, services: &[String]) -> bool {
    let stem = name
        .strip_suffix(&format!(".{MANIFEST_EXTENSION}"))
        .unwrap_or(name);
    services.is_empty() || services.iter().any(|s| s == stem)
}

fn kubectl<I, S>(args: I) -> Invocation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Invocation::new("kubectl").args(args)
}

pub async fn deploy(
    driver: &Driver,
    ctx: &KardContext,
    action: DeployAction,
    services: &[String],
) -> Result<DeployReport> {
    match action {
        DeployAction::Start => start(driver, ctx, services).await,
        DeployAction::Stop => stop(driver, ctx, services).await,
    }
}

async fn start(driver: &Driver, ctx: &KardContext, services: &[String]) -> Result<DeployReport> {
    let cluster = driver.cluster().await?;
    let previous = cluster.load_state(&ctx.name).await?;
    let manifests = manifests(ctx)?;

    let mut next = DeployedFiles::new();
    let saved = std::iter::once((META_FILE.to_string(), ctx.path.join(META_FILE)))
        .chain(manifests.iter().cloned());
    for (name, path) in saved {
        if !is_selected(&name, services) {
            // unselected files keep what was deployed before
            if let Some(old) = previous.get(&name) {
                next.insert(name, old.clone());
            }
            continue;
        }
        let content = std::fs::read_to_string(&path)?;
        next.insert(name, content);
    }

    let mut report = DeployReport {
        changes: diff::compare(&previous, &next),
        ..Default::default()
    };

    for (name, path) in &manifests {
        if !is_selected(name, services) {
            continue;
        }
        tracing::info!(manifest = %name, "applying");
        let apply = kubectl(["apply", "-f"]).arg(path.to_string_lossy());
        driver.exec(ctx, &apply).await?;
        report.services.push(name.clone());
    }

    for (name, content) in &previous {
        if next.contains_key(name) || name == META_FILE {
            continue;
        }
        tracing::info!(manifest = %name, "deleting removed manifest");
        let delete = kubectl(["delete", "-f", "-"]).stdin(content.clone());
        driver.exec(ctx, &delete).await?;
        report.deleted.push(name.clone());
    }

    cluster.save_state(&ctx.name, &next).await?;
    Ok(report)
}

async fn stop(driver: &Driver, ctx: &KardContext, services: &[String]) -> Result<DeployReport> {
    let cluster = driver.cluster().await?;
    let mut report = DeployReport::default();

    for (name, path) in manifests(ctx)?.iter().rev() {
        if !is_selected(name, services) {
            continue;
        }
        tracing::info!(manifest = %name, "deleting");
        let delete = kubectl(["delete", "-f"]).arg(path.to_string_lossy());
        driver.exec(ctx, &delete).await?;
        report.services.push(name.clone());
    }

    let remaining = if services.is_empty() {
        DeployedFiles::new()
    } else {
        let mut state = cluster.load_state(&ctx.name).await?;
        state.retain(|name, _| !report.services.contains(name));
        state
    };
    cluster.save_state(&ctx.name, &remaining).await?;
    Ok(report)
}

/// Pods of `driver.k8s.namespace`
pub async fn ps(driver: &Driver, ctx: &KardContext) -> Result<Vec<String>> {
    let namespace = ctx
        .driver_setting("k8s", "namespace")
        .and_then(JsonValue::as_str)
        .unwrap_or(DEFAULT_NAMESPACE);
    let cluster = driver.cluster().await?;

    Ok(cluster
        .list_pods(namespace)
        .await?
        .into_iter()
        .map(|pod| {
            format!(
                "{}: {} - {}",
                pod.name,
                pod.phase.as_deref().unwrap_or("Unknown"),
                pod.ip.as_deref().unwrap_or("none")
            )
        })
        .collect())
}

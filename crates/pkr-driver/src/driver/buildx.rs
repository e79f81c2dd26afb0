//! `docker buildx` build entry, with a registry layer cache

use pkr_core::Meta;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;

use super::docker::{self, BuildJob};
use super::{BuildOptions, BuildReport, Driver};
use crate::command::Invocation;
use crate::context::KardContext;
use crate::error::Result;

pub const DEFAULT_BUILDER: &str = "pkrbuilder";

const CACHE_REGISTRY_KEY: &str = "buildx.cache_registry";

/// Driver options of a new builder, before `buildx.buildkit_env`
const BUILDKIT_DEFAULTS: [(&str, &str); 2] = [
    ("env.BUILDKIT_STEP_LOG_MAX_SIZE", "1000000"),
    ("env.BUILDKIT_STEP_LOG_MAX_SPEED", "100000000"),
];

/// `"None"` disables the cache; a bare host gets a `/cache` repository
pub fn normalize_cache_registry(meta: &mut Meta) {
    let normalized = match meta.get(CACHE_REGISTRY_KEY) {
        Some(JsonValue::String(s)) if s == "None" => Some(JsonValue::Null),
        Some(JsonValue::String(s)) if !s.contains('/') => Some(json!(format!("{s}/cache"))),
        _ => None,
    };
    if let Some(value) = normalized {
        meta.set(CACHE_REGISTRY_KEY, value);
    }
}

fn scalar_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `buildx.*` settings of a kard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildxSettings {
    pub builder: String,
    /// Cache repository, `None` without cache
    pub cache: Option<String>,
    /// `env.KEY=VALUE` options of a new builder
    pub driver_opts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BuildxSettings {
    pub fn from_meta(meta: &Meta) -> Self {
        let string = |key: &str| meta.get_str(&format!("buildx.{key}")).map(str::to_string);

        let mut env: BTreeMap<String, String> = BUILDKIT_DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(JsonValue::Object(custom)) = meta.get("buildx.buildkit_env") {
            for (key, value) in custom {
                let key = if key.starts_with("env.") {
                    key.clone()
                } else {
                    format!("env.{key}")
                };
                env.insert(key, scalar_string(value));
            }
        }

        Self {
            builder: string("builder_name").unwrap_or_else(|| DEFAULT_BUILDER.to_string()),
            cache: string("cache_registry").filter(|c| !c.is_empty() && c != "None"),
            driver_opts: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            username: string("cache_registry_username"),
            password: string("cache_registry_password"),
        }
    }

    /// `--cache-to`/`--cache-from`/`--no-cache` arguments
    pub fn cache_args(&self, nocache: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(cache) = &self.cache {
            args.push("--cache-to".to_string());
            args.push(format!("type=registry,mode=max,ref={cache}"));
            if !nocache {
                args.push("--cache-from".to_string());
                args.push(format!("type=registry,ref={cache}"));
            }
        }
        if nocache {
            args.push("--no-cache".to_string());
        }
        args
    }

    fn build_invocation(&self, job: &BuildJob, options: &BuildOptions) -> Invocation {
        let mut invocation = Invocation::new("docker")
            .args(["buildx", "build", "--builder", self.builder.as_str()])
            .args(["--load", "--progress", "plain", "-t", job.image.as_str(), "-f"])
            .arg(job.dockerfile.to_string_lossy());
        if let Some(target) = &job.target {
            invocation = invocation.args(["--target", target.as_str()]);
        }
        invocation
            .args(self.cache_args(options.nocache))
            .arg(job.context.to_string_lossy())
    }
}

fn registry_host(cache: &str) -> &str {
    cache.split('/').next().unwrap_or(cache)
}

async fn ensure_builder(
    driver: &Driver,
    ctx: &KardContext,
    settings: &BuildxSettings,
    clean: bool,
) -> Result<()> {
    let builder = settings.builder.as_str();
    let mut exists = driver
        .probe(&Invocation::new("docker").args(["buildx", "inspect", builder]))
        .await?;

    if exists && clean {
        tracing::info!(builder, "removing buildx builder");
        driver
            .exec(ctx, &Invocation::new("docker").args(["buildx", "rm", builder]))
            .await?;
        exists = false;
    }
    if !exists {
        tracing::info!(builder, "creating buildx builder");
        let mut create = Invocation::new("docker").args(["buildx", "create", "--name", builder]);
        for opt in &settings.driver_opts {
            create = create.args(["--driver-opt", opt.as_str()]);
        }
        driver.exec(ctx, &create).await?;
    }
    Ok(())
}

pub async fn build(
    driver: &Driver,
    ctx: &KardContext,
    services: &[String],
    options: &BuildOptions,
) -> Result<BuildReport> {
    let settings = BuildxSettings::from_meta(&ctx.meta);
    let jobs = docker::build_jobs(ctx, services, options)?;
    if jobs.is_empty() {
        return Ok(BuildReport::default());
    }

    if let (Some(username), Some(cache)) = (&settings.username, &settings.cache) {
        docker::login(
            driver,
            ctx,
            registry_host(cache),
            username,
            settings.password.as_deref(),
        )
        .await?;
    }
    ensure_builder(driver, ctx, &settings, options.clean_builder).await?;

    docker::run_builds(driver, ctx, jobs, options, |job| {
        settings.build_invocation(job, options)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{MockResponse, MockRunner};
    use crate::driver::DriverKind;
    use crate::driver::testing::{context, pkr_root};
    use std::sync::Arc;

    const ENV: &str = "containers:\n  api:\n    dockerfile: api.dockerfile\n  db: {}\n";

    #[test]
    fn test_normalize_cache_registry() {
        let mut meta = Meta::from(json!({"buildx": {"cache_registry": "registry.local:5000"}}));
        normalize_cache_registry(&mut meta);
        assert_eq!(meta.get_str(CACHE_REGISTRY_KEY), Some("registry.local:5000/cache"));

        let mut meta = Meta::from(json!({"buildx": {"cache_registry": "registry.local/layers"}}));
        normalize_cache_registry(&mut meta);
        assert_eq!(meta.get_str(CACHE_REGISTRY_KEY), Some("registry.local/layers"));

        let mut meta = Meta::from(json!({"buildx": {"cache_registry": "None"}}));
        normalize_cache_registry(&mut meta);
        assert_eq!(meta.get(CACHE_REGISTRY_KEY), Some(&JsonValue::Null));
    }

    #[test]
    fn test_settings_from_meta() {
        let meta = Meta::from(json!({
            "buildx": {
                "cache_registry": "hub/cache",
                "buildkit_env": {"BUILDKIT_STEP_LOG_MAX_SIZE": 50, "env.EXTRA": "on"},
            }
        }));
        let settings = BuildxSettings::from_meta(&meta);
        assert_eq!(settings.builder, DEFAULT_BUILDER);
        assert_eq!(settings.cache.as_deref(), Some("hub/cache"));
        assert_eq!(
            settings.driver_opts,
            vec![
                "env.BUILDKIT_STEP_LOG_MAX_SIZE=50",
                "env.BUILDKIT_STEP_LOG_MAX_SPEED=100000000",
                "env.EXTRA=on",
            ]
        );
    }

    #[test]
    fn test_cache_args() {
        let mut settings = BuildxSettings::from_meta(&Meta::from(json!({
            "buildx": {"cache_registry": "hub/cache"}
        })));
        assert_eq!(
            settings.cache_args(false),
            vec![
                "--cache-to",
                "type=registry,mode=max,ref=hub/cache",
                "--cache-from",
                "type=registry,ref=hub/cache",
            ]
        );
        assert_eq!(
            settings.cache_args(true),
            vec!["--cache-to", "type=registry,mode=max,ref=hub/cache", "--no-cache"]
        );

        settings.cache = None;
        assert!(settings.cache_args(false).is_empty());
    }

    #[tokio::test]
    async fn test_build_creates_builder_and_logs_in() {
        let dir = pkr_root(ENV);
        let ctx = context(
            &dir,
            json!({
                "tag": "1",
                "buildx": {
                    "cache_registry": "cache.local/cache",
                    "cache_registry_username": "bot",
                    "cache_registry_password": "pw",
                    "builder_name": "ci",
                }
            }),
        );
        let runner = MockRunner::new();
        runner.respond("docker buildx inspect", MockResponse::Failure("no builder".into()));
        let driver = Driver::new(DriverKind::Buildx, Arc::new(runner.clone()));

        let report = driver.build(&ctx, &[], &BuildOptions::default()).await.unwrap();
        assert_eq!(report.built, vec!["api:1"]);

        let kard = ctx.path.display().to_string();
        assert_eq!(
            runner.command_lines(),
            vec![
                "docker login cache.local -u bot --password-stdin".to_string(),
                "docker buildx inspect ci".to_string(),
                "docker buildx create --name ci --driver-opt env.BUILDKIT_STEP_LOG_MAX_SIZE=1000000 --driver-opt env.BUILDKIT_STEP_LOG_MAX_SPEED=100000000".to_string(),
                format!(
                    "docker buildx build --builder ci --load --progress plain -t api:1 -f {kard}/docker-context/api.dockerfile --cache-to type=registry,mode=max,ref=cache.local/cache --cache-from type=registry,ref=cache.local/cache {kard}/docker-context"
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_clean_builder_recreates() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1", "buildx": {"cache_registry": null}}));
        let runner = MockRunner::new();
        let driver = Driver::new(DriverKind::BuildxCompose, Arc::new(runner.clone()));

        let options = BuildOptions {
            clean_builder: true,
            ..Default::default()
        };
        driver.build(&ctx, &[], &options).await.unwrap();

        let lines = runner.command_lines();
        assert_eq!(lines[0], "docker buildx inspect pkrbuilder");
        assert_eq!(lines[1], "docker buildx rm pkrbuilder");
        assert!(lines[2].starts_with("docker buildx create --name pkrbuilder"));
        assert!(!lines[3].contains("--cache-to"));
    }
}

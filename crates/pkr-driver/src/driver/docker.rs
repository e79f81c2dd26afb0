//! Docker backend: build contexts, `docker build` and image operations

use futures::stream::{self, StreamExt, TryStreamExt};
use pkr_core::CoreError;
use pkr_engine::{CopyRule, FileRenderer, RenderPlan};
use std::path::{Path, PathBuf};

use super::{BuildOptions, BuildReport, Driver, PurgeOptions, RegistryOptions};
use crate::command::Invocation;
use crate::context::KardContext;
use crate::error::{DriverError, Result};

/// Template subfolder holding Dockerfile templates
pub const DOCKERFILES_DIR: &str = "dockerfiles";

/// One image to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    pub service: String,
    /// `name:tag`
    pub image: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub target: Option<String>,
}

pub fn plan(ctx: &KardContext, renderer: &FileRenderer) -> Result<RenderPlan> {
    let mut plan = RenderPlan::new(&ctx.path);
    let base = ctx.source_base();
    let dockerfiles = ctx.env.template_dir().join(DOCKERFILES_DIR);

    for container in ctx.env.containers()? {
        let context = Path::new(container.context_dir());
        plan.manage(context);

        for require in container.require_rules() {
            let rule = CopyRule::copy(&require.origin, &require.dst).with_exclude(require.exclude);
            plan.add_rule(context, &rule, &base, None)?;
        }

        // hub images have nothing to render
        let Some(dockerfile) = &container.dockerfile else {
            continue;
        };
        let stem = Path::new(dockerfile)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| dockerfile.clone());
        let pattern = dockerfiles.join(format!("{stem}*"));
        let rule = CopyRule::render(pattern.to_string_lossy(), "").with_origin(&dockerfiles);
        plan.add_rule(context, &rule, &base, Some(renderer))?;
    }

    Ok(plan)
}

pub(crate) fn missing_tag() -> DriverError {
    CoreError::MissingMeta {
        keys: vec!["tag".to_string()],
    }
    .into()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Containers to build: the requested ones, all when empty, only those with a Dockerfile
pub(crate) fn build_jobs(
    ctx: &KardContext,
    services: &[String],
    options: &BuildOptions,
) -> Result<Vec<BuildJob>> {
    let tag = options.tag.clone().or_else(|| ctx.tag()).ok_or_else(missing_tag)?;
    let names = if services.is_empty() {
        ctx.env.container_names()
    } else {
        services.to_vec()
    };
    let helpers = ctx.helpers()?;

    let mut jobs = Vec::new();
    for name in names {
        let container = ctx.env.container(&name)?;
        let Some(dockerfile) = &container.dockerfile else {
            tracing::debug!(service = %name, "no dockerfile, nothing to build");
            continue;
        };
        let context = ctx.path.join(container.context_dir());
        jobs.push(BuildJob {
            image: helpers.make_image_name(&name, Some(&tag)),
            dockerfile: context.join(dockerfile),
            context,
            target: options.target.clone().or(container.target.clone()),
            service: name,
        });
    }
    Ok(jobs)
}

fn build_invocation(job: &BuildJob, options: &BuildOptions) -> Invocation {
    let mut invocation = Invocation::new("docker")
        .args(["build", "--force-rm", "-t", job.image.as_str(), "-f"])
        .arg(path_arg(&job.dockerfile));
    if options.nocache {
        invocation = invocation.arg("--no-cache");
    }
    if let Some(target) = &job.target {
        invocation = invocation.args(["--target", target.as_str()]);
    }
    invocation.arg(path_arg(&job.context))
}

pub async fn build(
    driver: &Driver,
    ctx: &KardContext,
    services: &[String],
    options: &BuildOptions,
) -> Result<BuildReport> {
    let jobs = build_jobs(ctx, services, options)?;
    run_builds(driver, ctx, jobs, options, |job| build_invocation(job, options)).await
}

pub(crate) async fn image_exists(driver: &Driver, image: &str) -> Result<bool> {
    let output = driver
        .query(&Invocation::new("docker").args(["images", "-q", image]))
        .await?;
    Ok(!output.stdout.trim().is_empty())
}

async fn build_one<F>(
    driver: &Driver,
    ctx: &KardContext,
    job: &BuildJob,
    options: &BuildOptions,
    invocation: &F,
) -> Result<bool>
where
    F: Fn(&BuildJob) -> Invocation,
{
    if options.no_rebuild && image_exists(driver, &job.image).await? {
        tracing::info!(image = %job.image, "image exists, not rebuilding");
        return Ok(false);
    }
    tracing::info!(service = %job.service, image = %job.image, "building image");
    driver.exec(ctx, &invocation(job)).await?;
    Ok(true)
}

/// Run builds with at most `options.parallel` at a time
///
/// A failed build does not stop the others. Failures are reported together,
/// unless one of them was a cancellation.
pub(crate) async fn run_builds<F>(
    driver: &Driver,
    ctx: &KardContext,
    jobs: Vec<BuildJob>,
    options: &BuildOptions,
    invocation: F,
) -> Result<BuildReport>
where
    F: Fn(&BuildJob) -> Invocation,
{
    let parallel = options.parallel.unwrap_or(1).max(1);
    let invocation = &invocation;

    let outcomes: Vec<(BuildJob, Result<bool>)> = stream::iter(jobs)
        .map(|job| async move {
            let result = build_one(driver, ctx, &job, options, invocation).await;
            (job, result)
        })
        .buffer_unordered(parallel)
        .collect()
        .await;

    let mut report = BuildReport::default();
    let mut failures = Vec::new();
    let mut cancelled = false;
    for (job, result) in outcomes {
        match result {
            Ok(true) => report.built.push(job.image),
            Ok(false) => report.skipped.push(job.image),
            Err(DriverError::Cancelled) => cancelled = true,
            Err(err) => failures.push((job.service, err)),
        }
    }

    if cancelled {
        return Err(DriverError::Cancelled);
    }
    if !failures.is_empty() {
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        return Err(DriverError::BuildFailed { failures });
    }
    report.built.sort();
    report.skipped.sort();
    Ok(report)
}

/// `docker login` with the password on stdin
pub(crate) async fn login(
    driver: &Driver,
    ctx: &KardContext,
    host: &str,
    username: &str,
    password: Option<&str>,
) -> Result<()> {
    tracing::info!(registry = host, username, "logging in");
    let invocation = Invocation::new("docker")
        .args(["login", host, "-u", username, "--password-stdin"])
        .stdin(password.unwrap_or_default());
    driver.exec(ctx, &invocation).await?;
    Ok(())
}

struct Registry {
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl Registry {
    fn resolve(ctx: &KardContext, options: &RegistryOptions) -> Result<Self> {
        let from_meta = |key: &str| ctx.meta.get_str(key).map(str::to_string);
        let url = options
            .registry
            .clone()
            .or_else(|| from_meta("registry"))
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                DriverError::InvalidConfig("no registry given and meta 'registry' is not set".into())
            })?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            username: options.username.clone().or_else(|| from_meta("username")),
            password: options.password.clone().or_else(|| from_meta("password")),
        })
    }

    async fn login(&self, driver: &Driver, ctx: &KardContext) -> Result<()> {
        match &self.username {
            Some(username) => {
                login(driver, ctx, &self.url, username, self.password.as_deref()).await
            }
            None => Ok(()),
        }
    }
}

/// Requested services, or every container with a Dockerfile
fn image_services(ctx: &KardContext, services: &[String]) -> Result<Vec<String>> {
    if !services.is_empty() {
        for service in services {
            ctx.env.container(service)?;
        }
        return Ok(services.to_vec());
    }
    Ok(ctx
        .env
        .containers()?
        .into_iter()
        .filter(|c| c.dockerfile.is_some())
        .map(|c| c.name)
        .collect())
}

/// Tag and push images; returns the pushed references
pub async fn push(
    driver: &Driver,
    ctx: &KardContext,
    services: &[String],
    options: &RegistryOptions,
) -> Result<Vec<String>> {
    let registry = Registry::resolve(ctx, options)?;
    let tag = options.tag.clone().or_else(|| ctx.tag()).ok_or_else(missing_tag)?;
    let helpers = ctx.helpers()?;
    let services = image_services(ctx, services)?;
    registry.login(driver, ctx).await?;

    let mut tags = vec![tag.clone()];
    tags.extend(options.other_tags.iter().cloned());
    let tags = &tags;

    let todos: Vec<(String, String)> = services
        .iter()
        .map(|s| {
            (
                helpers.make_image_name(s, Some(&tag)),
                format!("{}/{}", registry.url, helpers.make_image_name(s, None)),
            )
        })
        .collect();

    let pushed: Vec<Vec<String>> = stream::iter(todos)
        .map(|(image, remote)| async move {
            let mut references = Vec::new();
            for dest_tag in tags {
                let reference = format!("{remote}:{dest_tag}");
                tracing::info!(image = %image, reference = %reference, "pushing");
                driver
                    .exec(ctx, &Invocation::new("docker").args(["tag", image.as_str(), reference.as_str()]))
                    .await?;
                driver
                    .exec(ctx, &Invocation::new("docker").args(["push", reference.as_str()]))
                    .await?;
                references.push(reference);
            }
            Ok::<_, DriverError>(references)
        })
        .buffer_unordered(options.parallel.unwrap_or(1).max(1))
        .try_collect()
        .await?;

    let mut references: Vec<String> = pushed.into_iter().flatten().collect();
    references.sort();
    Ok(references)
}

/// Pull images and retag them under their local name
///
/// `options.tag` selects the remote tag; the local tag stays the meta `tag`.
pub async fn pull(
    driver: &Driver,
    ctx: &KardContext,
    services: &[String],
    options: &RegistryOptions,
) -> Result<Vec<String>> {
    let registry = Registry::resolve(ctx, options)?;
    let local_tag = ctx.tag();
    let remote_tag = options
        .tag
        .clone()
        .or_else(|| local_tag.clone())
        .ok_or_else(missing_tag)?;
    let local_tag = local_tag.unwrap_or_else(|| remote_tag.clone());
    let helpers = ctx.helpers()?;
    let services = image_services(ctx, services)?;
    registry.login(driver, ctx).await?;

    let todos: Vec<(String, String)> = services
        .iter()
        .map(|s| {
            (
                format!("{}/{}:{remote_tag}", registry.url, helpers.make_image_name(s, None)),
                helpers.make_image_name(s, Some(&local_tag)),
            )
        })
        .collect();

    let mut pulled: Vec<String> = stream::iter(todos)
        .map(|(remote, local)| async move {
            tracing::info!(reference = %remote, image = %local, "pulling");
            driver
                .exec(ctx, &Invocation::new("docker").args(["pull", remote.as_str()]))
                .await?;
            driver
                .exec(ctx, &Invocation::new("docker").args(["tag", remote.as_str(), local.as_str()]))
                .await?;
            Ok::<_, DriverError>(local)
        })
        .buffer_unordered(options.parallel.unwrap_or(1).max(1))
        .try_collect()
        .await?;

    pulled.sort();
    Ok(pulled)
}

/// Image names of the services, tagged with `tag` or the meta `tag`
pub fn list_images(ctx: &KardContext, services: &[String], tag: Option<&str>) -> Result<Vec<String>> {
    let helpers = ctx.helpers()?;
    let tag = tag.map(str::to_string).or_else(|| ctx.tag());
    Ok(image_services(ctx, services)?
        .iter()
        .map(|s| helpers.make_image_name(s, tag.as_deref()))
        .collect())
}

fn purge_matches(
    reference: &str,
    names: &[String],
    repository: Option<&str>,
    tag: Option<&str>,
    except_tag: Option<&str>,
) -> bool {
    let Some((repo, image_tag)) = reference.rsplit_once(':') else {
        return false;
    };
    let known = names.iter().any(|name| {
        repo == name
            || repository
                .is_some_and(|r| repo == format!("{}/{name}", r.trim_end_matches('/')))
    });
    if !known {
        return false;
    }
    match (tag, except_tag) {
        (_, Some(except)) => image_tag != except,
        (Some(tag), None) => image_tag == tag,
        (None, None) => true,
    }
}

/// Remove local images of the kard's containers; returns removed references
///
/// Removal failures are logged and skipped.
pub async fn purge(driver: &Driver, ctx: &KardContext, options: &PurgeOptions) -> Result<Vec<String>> {
    let helpers = ctx.helpers()?;
    let names: Vec<String> = ctx
        .env
        .container_names()
        .iter()
        .map(|s| helpers.make_image_name(s, None))
        .collect();
    let tag = match &options.except_tag {
        Some(_) => None,
        None => Some(options.tag.clone().or_else(|| ctx.tag()).ok_or_else(missing_tag)?),
    };

    let listing = driver
        .exec(
            ctx,
            &Invocation::new("docker").args(["images", "--format", "{{.Repository}}:{{.Tag}}"]),
        )
        .await?;

    let mut removed = Vec::new();
    for reference in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !purge_matches(
            reference,
            &names,
            options.repository.as_deref(),
            tag.as_deref(),
            options.except_tag.as_deref(),
        ) {
            continue;
        }
        tracing::info!(image = reference, "removing image");
        match driver
            .exec(ctx, &Invocation::new("docker").args(["rmi", reference]))
            .await
        {
            Ok(_) => removed.push(reference.to_string()),
            Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
            Err(err) => tracing::warn!(image = reference, error = %err, "could not remove image"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{MockResponse, MockRunner};
    use crate::driver::DriverKind;
    use crate::driver::testing::{context, pkr_root, renderer, write};
    use serde_json::json;
    use std::sync::Arc;

    const ENV: &str = r#"
containers:
  api:
    dockerfile: api.dockerfile
    target: prod
    requires:
      conf/app.ini:
        dst: app.ini
  worker:
    dockerfile: worker.dockerfile
    context: worker-context
  redis: {}
"#;

    fn driver(runner: &MockRunner) -> Driver {
        Driver::new(DriverKind::Docker, Arc::new(runner.clone()))
    }

    #[test]
    fn test_docker_plan() {
        let dir = pkr_root(ENV);
        write(dir.path(), "conf/app.ini", "[app]\n");
        write(
            dir.path(),
            "templates/dockerfiles/api.dockerfile.template",
            "FROM python:3\nLABEL kard={{ kard_name }}\n",
        );
        write(dir.path(), "templates/dockerfiles/worker.dockerfile", "FROM alpine\n");
        write(dir.path(), "templates/dockerfiles/worker.entrypoint.sh", "#!/bin/sh\n");

        let ctx = context(&dir, json!({"tag": "1"}));
        let plan = plan(&ctx, &renderer(&ctx)).unwrap();
        let files: Vec<String> = plan
            .files()
            .keys()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            files,
            vec![
                "docker-context/api.dockerfile",
                "docker-context/app.ini",
                "worker-context/worker.dockerfile",
                "worker-context/worker.entrypoint.sh",
            ]
        );

        plan.apply(true).unwrap();
        let dockerfile =
            std::fs::read_to_string(ctx.path.join("docker-context/api.dockerfile")).unwrap();
        assert_eq!(dockerfile, "FROM python:3\nLABEL kard=demo\n");
    }

    #[tokio::test]
    async fn test_build_commands() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1.0", "image_pattern": "acme/%s"}));
        let runner = MockRunner::new();

        let report = driver(&runner)
            .build(&ctx, &[], &BuildOptions::default().nocache())
            .await
            .unwrap();
        assert_eq!(report.built, vec!["acme/api:1.0", "acme/worker:1.0"]);

        let kard = ctx.path.display().to_string();
        assert_eq!(
            runner.command_lines(),
            vec![
                format!(
                    "docker build --force-rm -t acme/api:1.0 -f {kard}/docker-context/api.dockerfile --no-cache --target prod {kard}/docker-context"
                ),
                format!(
                    "docker build --force-rm -t acme/worker:1.0 -f {kard}/worker-context/worker.dockerfile --no-cache {kard}/worker-context"
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_requires_tag() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({}));
        let runner = MockRunner::new();

        let err = driver(&runner)
            .build(&ctx, &[], &BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Core(CoreError::MissingMeta { .. })));

        let report = driver(&runner)
            .build(&ctx, &["api".to_string()], &BuildOptions::default().with_tag("dev"))
            .await
            .unwrap();
        assert_eq!(report.built, vec!["api:dev"]);
    }

    #[tokio::test]
    async fn test_no_rebuild_skips_existing() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1"}));
        let runner = MockRunner::new();
        runner.respond("docker images -q api:1", MockResponse::Success("3f2a9c\n".into()));

        let report = driver(&runner)
            .build(&ctx, &[], &BuildOptions::default().no_rebuild())
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["api:1"]);
        assert_eq!(report.built, vec!["worker:1"]);
    }

    #[tokio::test]
    async fn test_build_failures_are_collected() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1"}));
        let runner = MockRunner::new();
        runner.respond(
            "docker build --force-rm -t api:1",
            MockResponse::Failure("COPY failed: file not found".into()),
        );

        let err = driver(&runner)
            .build(&ctx, &[], &BuildOptions::default().with_parallel(2))
            .await
            .unwrap_err();
        match err {
            DriverError::BuildFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "api");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the other build still ran
        assert!(
            runner
                .command_lines()
                .iter()
                .any(|l| l.contains("-t worker:1"))
        );
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1"}));
        let runner = MockRunner::new();
        runner.respond("docker build", MockResponse::Cancelled);

        let err = driver(&runner)
            .build(&ctx, &[], &BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
    }

    #[tokio::test]
    async fn test_push_with_login_and_extra_tags() {
        let dir = pkr_root(ENV);
        let ctx = context(
            &dir,
            json!({"tag": "1", "registry": "registry.local:5000/", "username": "ci", "password": "s3cret"}),
        );
        let runner = MockRunner::new();
        let options = RegistryOptions {
            other_tags: vec!["latest".to_string()],
            ..Default::default()
        };

        let pushed = driver(&runner)
            .push(&ctx, &["api".to_string()], &options)
            .await
            .unwrap();
        assert_eq!(
            pushed,
            vec!["registry.local:5000/api:1", "registry.local:5000/api:latest"]
        );

        let calls = runner.calls();
        assert_eq!(
            calls[0].command_line(),
            "docker login registry.local:5000 -u ci --password-stdin"
        );
        assert_eq!(calls[0].stdin.as_deref(), Some("s3cret"));
        assert_eq!(
            runner.command_lines()[1..],
            [
                "docker tag api:1 registry.local:5000/api:1",
                "docker push registry.local:5000/api:1",
                "docker tag api:1 registry.local:5000/api:latest",
                "docker push registry.local:5000/api:latest",
            ]
        );
    }

    #[tokio::test]
    async fn test_push_requires_registry() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1"}));
        let runner = MockRunner::new();
        let err = driver(&runner)
            .push(&ctx, &[], &RegistryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidConfig(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pull_retags_locally() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1", "registry": "hub.local"}));
        let runner = MockRunner::new();
        let options = RegistryOptions {
            tag: Some("stable".to_string()),
            ..Default::default()
        };

        let pulled = driver(&runner)
            .pull(&ctx, &["worker".to_string()], &options)
            .await
            .unwrap();
        assert_eq!(pulled, vec!["worker:1"]);
        assert_eq!(
            runner.command_lines(),
            vec![
                "docker pull hub.local/worker:stable",
                "docker tag hub.local/worker:stable worker:1",
            ]
        );
    }

    #[test]
    fn test_list_images_defaults_to_buildable() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "2"}));
        assert_eq!(list_images(&ctx, &[], None).unwrap(), vec!["api:2", "worker:2"]);
        assert_eq!(
            list_images(&ctx, &["redis".to_string()], Some("x")).unwrap(),
            vec!["redis:x"]
        );
        assert!(list_images(&ctx, &["nope".to_string()], None).is_err());
    }

    #[test]
    fn test_purge_matching() {
        let names = vec!["api".to_string(), "worker".to_string()];
        assert!(purge_matches("api:1", &names, None, Some("1"), None));
        assert!(!purge_matches("api:2", &names, None, Some("1"), None));
        assert!(!purge_matches("apigw:1", &names, None, Some("1"), None));
        assert!(!purge_matches("hub/api:1", &names, None, Some("1"), None));
        assert!(purge_matches("hub/api:1", &names, Some("hub/"), Some("1"), None));
        assert!(purge_matches("worker:old", &names, None, None, Some("1")));
        assert!(!purge_matches("worker:1", &names, None, None, Some("1")));
        assert!(!purge_matches("<none>:<none>", &names, None, None, Some("1")));
    }

    #[tokio::test]
    async fn test_purge_removes_and_tolerates_failures() {
        let dir = pkr_root(ENV);
        let ctx = context(&dir, json!({"tag": "1"}));
        let runner = MockRunner::new();
        runner.respond(
            "docker images --format",
            MockResponse::Success("api:1\napi:0\nworker:1\npostgres:1\n".into()),
        );
        runner.respond("docker rmi worker:1", MockResponse::Failure("image is in use".into()));

        let removed = driver(&runner)
            .purge(&ctx, &PurgeOptions::default())
            .await
            .unwrap();
        assert_eq!(removed, vec!["api:1"]);
        assert!(
            runner
                .command_lines()
                .contains(&"docker rmi worker:1".to_string())
        );
    }
}

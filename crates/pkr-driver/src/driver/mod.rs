//! Deployment backends
//!
//! Every variant is a row of a capability table: a parent and the entries
//! it overrides. Looking up an operation walks the parent chain, so the
//! composite variants (`buildx_compose`, `buildx_k8s`) only name the build
//! entry they swap in.

pub mod base;
pub mod buildx;
pub mod compose;
pub mod docker;
pub mod k8s;

use pkr_core::Meta;
use pkr_engine::{FileRenderer, RenderPlan};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::cluster::{Cluster, KubeCluster};
use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::context::KardContext;
use crate::diff::FileChange;
use crate::error::{DriverError, Result};
use crate::retry::RetryPolicy;

/// Driver used when `driver.name` is not set
pub const DEFAULT_DRIVER: &str = "compose";

/// Meta key selecting the driver
pub const DRIVER_NAME_KEY: &str = "driver.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriverKind {
    Base,
    Docker,
    Buildx,
    Compose,
    BuildxCompose,
    K8s,
    BuildxK8s,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Render,
    Build,
    Deploy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Render => "render",
            Operation::Build => "build",
            Operation::Deploy => "deploy",
        };
        f.write_str(s)
    }
}

/// Implementation behind one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    BaseRender,
    DockerRender,
    ComposeRender,
    K8sRender,
    DockerBuild,
    BuildxBuild,
    ComposeDeploy,
    K8sDeploy,
    Unsupported,
}

impl Entry {
    /// Meta keys the entry cannot work without
    fn required_meta(self) -> Vec<JsonValue> {
        match self {
            Entry::DockerBuild => vec![json!("tag")],
            Entry::BuildxBuild => vec![json!("tag"), json!({"buildx": ["cache_registry"]})],
            Entry::ComposeDeploy => vec![json!("tag"), json!("project_name")],
            Entry::K8sDeploy => vec![json!("registry"), json!("tag")],
            _ => Vec::new(),
        }
    }
}

struct Variant {
    kind: DriverKind,
    parent: Option<DriverKind>,
    overrides: &'static [(Operation, Entry)],
}

const TABLE: &[Variant] = &[
    Variant {
        kind: DriverKind::Base,
        parent: None,
        overrides: &[
            (Operation::Render, Entry::BaseRender),
            (Operation::Build, Entry::Unsupported),
            (Operation::Deploy, Entry::Unsupported),
        ],
    },
    Variant {
        kind: DriverKind::Docker,
        parent: Some(DriverKind::Base),
        overrides: &[
            (Operation::Render, Entry::DockerRender),
            (Operation::Build, Entry::DockerBuild),
        ],
    },
    Variant {
        kind: DriverKind::Buildx,
        parent: Some(DriverKind::Docker),
        overrides: &[(Operation::Build, Entry::BuildxBuild)],
    },
    Variant {
        kind: DriverKind::Compose,
        parent: Some(DriverKind::Docker),
        overrides: &[
            (Operation::Render, Entry::ComposeRender),
            (Operation::Deploy, Entry::ComposeDeploy),
        ],
    },
    Variant {
        kind: DriverKind::BuildxCompose,
        parent: Some(DriverKind::Compose),
        overrides: &[(Operation::Build, Entry::BuildxBuild)],
    },
    Variant {
        kind: DriverKind::K8s,
        parent: Some(DriverKind::Docker),
        overrides: &[
            (Operation::Render, Entry::K8sRender),
            (Operation::Deploy, Entry::K8sDeploy),
        ],
    },
    Variant {
        kind: DriverKind::BuildxK8s,
        parent: Some(DriverKind::K8s),
        overrides: &[(Operation::Build, Entry::BuildxBuild)],
    },
];

impl DriverKind {
    pub const ALL: [DriverKind; 7] = [
        DriverKind::Base,
        DriverKind::Docker,
        DriverKind::Buildx,
        DriverKind::Compose,
        DriverKind::BuildxCompose,
        DriverKind::K8s,
        DriverKind::BuildxK8s,
    ];

    pub const NAMES: [&'static str; 7] = [
        "base",
        "docker",
        "buildx",
        "compose",
        "buildx_compose",
        "k8s",
        "buildx_k8s",
    ];

    /// Canonical name, as persisted in the kard
    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Base => "base",
            DriverKind::Docker => "docker",
            DriverKind::Buildx => "buildx",
            DriverKind::Compose => "compose",
            DriverKind::BuildxCompose => "buildx_compose",
            DriverKind::K8s => "k8s",
            DriverKind::BuildxK8s => "buildx_k8s",
        }
    }

    /// Canonical name or alias
    pub fn parse(name: &str) -> Result<Self> {
        let canonical = match name {
            "docker_compose" => "compose",
            "kubernetes" => "k8s",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|k| k.name() == canonical)
            .ok_or_else(|| DriverError::UnknownDriver {
                name: name.to_string(),
            })
    }

    /// Driver selected by `driver.name`, compose when unset
    pub fn from_meta(meta: &Meta) -> Result<Self> {
        match meta.get(DRIVER_NAME_KEY) {
            None | Some(JsonValue::Null) => Self::parse(DEFAULT_DRIVER),
            Some(JsonValue::String(name)) => Self::parse(name),
            Some(other) => Err(DriverError::UnknownDriver {
                name: other.to_string(),
            }),
        }
    }

    fn variant(self) -> &'static Variant {
        TABLE
            .iter()
            .find(|v| v.kind == self)
            .unwrap_or(&TABLE[0])
    }

    pub fn parent(self) -> Option<DriverKind> {
        self.variant().parent
    }

    /// Implementation of `op`, walking up the parent chain
    pub fn entry(self, op: Operation) -> Entry {
        let mut current = Some(self);
        while let Some(kind) = current {
            let variant = kind.variant();
            if let Some((_, entry)) = variant.overrides.iter().find(|(o, _)| *o == op) {
                return *entry;
            }
            current = variant.parent;
        }
        Entry::Unsupported
    }

    pub fn supports(self, op: Operation) -> bool {
        self.entry(op) != Entry::Unsupported
    }

    /// Required meta of every entry the driver uses
    pub fn required_meta(self) -> JsonValue {
        let mut required: Vec<JsonValue> = Vec::new();
        for op in [Operation::Render, Operation::Build, Operation::Deploy] {
            for key in self.entry(op).required_meta() {
                if !required.contains(&key) {
                    required.push(key);
                }
            }
        }
        JsonValue::Array(required)
    }

    /// `up` renders the kard before deploying
    pub fn makes_before_up(self) -> bool {
        self.entry(Operation::Deploy) == Entry::ComposeDeploy
    }

    pub fn uses_cluster(self) -> bool {
        self.entry(Operation::Deploy) == Entry::K8sDeploy
    }

    /// Meta the driver contributes at resolution time
    ///
    /// `meta` is the resolution so far, so defaults from the environment
    /// win over computed ones.
    pub fn get_meta(self, kard_name: &str, meta: &Meta) -> JsonValue {
        let mut contributed = Meta::new();
        if self.entry(Operation::Deploy) == Entry::ComposeDeploy && !meta.contains("project_name")
        {
            contributed.set("project_name", json!(compose::project_name(kard_name)));
        }
        contributed.into_inner()
    }

    /// Normalize resolved values the driver relies on
    pub fn finalize_meta(self, meta: &mut Meta) {
        if let Some(tag) = meta.get("tag").filter(|t| !t.is_string() && !t.is_null()) {
            let tag = tag.to_string();
            meta.set("tag", JsonValue::String(tag));
        }
        if self.entry(Operation::Build) == Entry::BuildxBuild {
            buildx::normalize_cache_registry(meta);
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Options of `pkr image build`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Overrides the meta `tag`
    pub tag: Option<String>,
    pub nocache: bool,
    /// Build stage, overrides the container `target`
    pub target: Option<String>,
    /// Skip images that already exist
    pub no_rebuild: bool,
    /// Maximum concurrent builds
    pub parallel: Option<usize>,
    /// Recreate the buildx builder
    pub clean_builder: bool,
}

impl BuildOptions {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn nocache(mut self) -> Self {
        self.nocache = true;
        self
    }

    pub fn no_rebuild(mut self) -> Self {
        self.no_rebuild = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Image names built
    pub built: Vec<String>,
    /// Image names left as they were
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployAction {
    Start,
    Stop,
}

#[derive(Debug, Default)]
pub struct DeployReport {
    /// Services or manifests acted on, in order
    pub services: Vec<String>,
    pub build: Option<BuildReport>,
    /// Difference with the previous deployment
    pub changes: Vec<FileChange>,
    /// Manifests of the previous deployment that were deleted
    pub deleted: Vec<String>,
}

/// Options of `pkr image push` and `pkr image pull`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Registry URL, meta `registry` when unset
    pub registry: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tag: Option<String>,
    /// Additional tags to push
    pub other_tags: Vec<String>,
    pub parallel: Option<usize>,
}

/// Options of `pkr image purge`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOptions {
    pub tag: Option<String>,
    /// Remove every tag but this one
    pub except_tag: Option<String>,
    /// Also remove references prefixed with this repository
    pub repository: Option<String>,
}

/// A driver bound to its collaborators
pub struct Driver {
    kind: DriverKind,
    runner: Arc<dyn CommandRunner>,
    cluster: OnceCell<Arc<dyn Cluster>>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver").field("kind", &self.kind).finish()
    }
}

impl Driver {
    pub fn new(kind: DriverKind, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            kind,
            runner,
            cluster: OnceCell::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = OnceCell::new_with(Some(cluster));
        self
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    fn unsupported(&self, operation: impl fmt::Display) -> DriverError {
        DriverError::unsupported(self.kind.name(), operation.to_string())
    }

    fn require(&self, op: Operation) -> Result<Entry> {
        match self.kind.entry(op) {
            Entry::Unsupported => Err(self.unsupported(op)),
            entry => Ok(entry),
        }
    }

    /// Run a collaborator, retrying transient failures per `driver.retry`
    pub(crate) async fn exec(&self, ctx: &KardContext, invocation: &Invocation) -> Result<CommandOutput> {
        let policy = RetryPolicy::from_meta(&ctx.meta)?;
        policy
            .run(&invocation.command_line(), || self.runner.run(invocation))
            .await
    }

    /// Run a collaborator once, reporting whether it succeeded
    pub(crate) async fn probe(&self, invocation: &Invocation) -> Result<bool> {
        self.runner.probe(invocation).await
    }

    /// Run a read-only collaborator once
    pub(crate) async fn query(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.runner.run(invocation).await
    }

    pub(crate) async fn cluster(&self) -> Result<Arc<dyn Cluster>> {
        self.cluster
            .get_or_try_init(|| async {
                let cluster = KubeCluster::connect().await?;
                Ok::<_, DriverError>(Arc::new(cluster) as Arc<dyn Cluster>)
            })
            .await
            .cloned()
    }

    /// Plan the driver outputs of a kard
    pub fn plan(&self, ctx: &KardContext, renderer: &FileRenderer) -> Result<RenderPlan> {
        match self.require(Operation::Render)? {
            Entry::BaseRender => base::plan(ctx, renderer),
            Entry::DockerRender => docker::plan(ctx, renderer),
            Entry::ComposeRender => compose::plan(ctx, renderer),
            Entry::K8sRender => k8s::plan(ctx, renderer),
            _ => Err(self.unsupported(Operation::Render)),
        }
    }

    /// Build the images of `services`, every container when empty
    pub async fn build(
        &self,
        ctx: &KardContext,
        services: &[String],
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        match self.require(Operation::Build)? {
            Entry::DockerBuild => docker::build(self, ctx, services, options).await,
            Entry::BuildxBuild => buildx::build(self, ctx, services, options).await,
            _ => Err(self.unsupported(Operation::Build)),
        }
    }

    pub async fn deploy(
        &self,
        ctx: &KardContext,
        action: DeployAction,
        services: &[String],
    ) -> Result<DeployReport> {
        match self.require(Operation::Deploy)? {
            Entry::ComposeDeploy => compose::deploy(self, ctx, action, services).await,
            Entry::K8sDeploy => k8s::deploy(self, ctx, action, services).await,
            _ => Err(self.unsupported(Operation::Deploy)),
        }
    }

    pub async fn restart(&self, ctx: &KardContext, services: &[String]) -> Result<()> {
        match self.require(Operation::Deploy)? {
            Entry::ComposeDeploy => compose::restart(self, ctx, services).await,
            _ => Err(self.unsupported("restart")),
        }
    }

    /// Remove what was deployed; `kill` stops compose containers first
    pub async fn clean(&self, ctx: &KardContext, kill: bool) -> Result<()> {
        match self.require(Operation::Deploy)? {
            Entry::ComposeDeploy => compose::clean(self, ctx, kill).await,
            Entry::K8sDeploy => k8s::deploy(self, ctx, DeployAction::Stop, &[])
                .await
                .map(|_| ()),
            _ => Err(self.unsupported("clean")),
        }
    }

    /// One line per running service or pod
    pub async fn ps(&self, ctx: &KardContext) -> Result<Vec<String>> {
        match self.require(Operation::Deploy)? {
            Entry::ComposeDeploy => compose::ps(self, ctx).await,
            Entry::K8sDeploy => k8s::ps(self, ctx).await,
            _ => Err(self.unsupported("ps")),
        }
    }

    /// Kards deployed in the cluster, as `k8s/<name>`
    pub async fn list_deployed(&self) -> Result<Vec<String>> {
        let cluster = self.cluster().await?;
        Ok(cluster
            .list_states()
            .await?
            .into_iter()
            .map(|name| format!("k8s/{name}"))
            .collect())
    }

    pub async fn push(&self, ctx: &KardContext, services: &[String], options: &RegistryOptions) -> Result<Vec<String>> {
        self.require(Operation::Build)
            .map_err(|_| self.unsupported("image push"))?;
        docker::push(self, ctx, services, options).await
    }

    pub async fn pull(&self, ctx: &KardContext, services: &[String], options: &RegistryOptions) -> Result<Vec<String>> {
        self.require(Operation::Build)
            .map_err(|_| self.unsupported("image pull"))?;
        docker::pull(self, ctx, services, options).await
    }

    pub fn list_images(&self, ctx: &KardContext, services: &[String], tag: Option<&str>) -> Result<Vec<String>> {
        self.require(Operation::Build)
            .map_err(|_| self.unsupported("image list"))?;
        docker::list_images(ctx, services, tag)
    }

    pub async fn purge(&self, ctx: &KardContext, options: &PurgeOptions) -> Result<Vec<String>> {
        self.require(Operation::Build)
            .map_err(|_| self.unsupported("image purge"))?;
        docker::purge(self, ctx, options).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockRunner;

    #[test]
    fn test_parse_and_aliases() {
        assert_eq!(DriverKind::parse("docker_compose").unwrap(), DriverKind::Compose);
        assert_eq!(DriverKind::parse("kubernetes").unwrap(), DriverKind::K8s);
        assert_eq!("buildx_k8s".parse::<DriverKind>().unwrap(), DriverKind::BuildxK8s);
        assert!(matches!(
            DriverKind::parse("swarm"),
            Err(DriverError::UnknownDriver { .. })
        ));

        for (kind, name) in DriverKind::ALL.iter().zip(DriverKind::NAMES) {
            assert_eq!(kind.name(), name);
        }
    }

    #[test]
    fn test_from_meta_defaults_to_compose() {
        assert_eq!(DriverKind::from_meta(&Meta::new()).unwrap(), DriverKind::Compose);
        let meta = Meta::from(json!({"driver": {"name": "kubernetes"}}));
        assert_eq!(DriverKind::from_meta(&meta).unwrap(), DriverKind::K8s);
    }

    #[test]
    fn test_capability_table() {
        use DriverKind::*;

        assert_eq!(Base.entry(Operation::Render), Entry::BaseRender);
        assert!(!Base.supports(Operation::Build));
        assert!(!Docker.supports(Operation::Deploy));

        assert_eq!(Buildx.entry(Operation::Render), Entry::DockerRender);
        assert_eq!(Buildx.entry(Operation::Build), Entry::BuildxBuild);

        assert_eq!(BuildxCompose.entry(Operation::Render), Entry::ComposeRender);
        assert_eq!(BuildxCompose.entry(Operation::Build), Entry::BuildxBuild);
        assert_eq!(BuildxCompose.entry(Operation::Deploy), Entry::ComposeDeploy);

        assert_eq!(BuildxK8s.entry(Operation::Render), Entry::K8sRender);
        assert_eq!(BuildxK8s.entry(Operation::Build), Entry::BuildxBuild);
        assert_eq!(K8s.entry(Operation::Build), Entry::DockerBuild);
        assert_eq!(K8s.parent(), Some(Docker));
    }

    #[test]
    fn test_required_meta() {
        assert_eq!(DriverKind::Base.required_meta(), json!([]));
        assert_eq!(DriverKind::Docker.required_meta(), json!(["tag"]));
        assert_eq!(DriverKind::Compose.required_meta(), json!(["tag", "project_name"]));
        assert_eq!(DriverKind::K8s.required_meta(), json!(["tag", "registry"]));
        assert_eq!(
            DriverKind::BuildxCompose.required_meta(),
            json!(["tag", {"buildx": ["cache_registry"]}, "project_name"])
        );
    }

    #[test]
    fn test_get_meta_project_name() {
        let meta = DriverKind::Compose.get_meta("My.Kard-1", &Meta::new());
        assert_eq!(meta, json!({"project_name": "mykard-1"}));

        let preset = Meta::from(json!({"project_name": "fixed"}));
        assert_eq!(DriverKind::Compose.get_meta("demo", &preset), json!({}));
        assert_eq!(DriverKind::K8s.get_meta("demo", &Meta::new()), json!({}));
    }

    #[test]
    fn test_finalize_meta_coerces_tag() {
        let mut meta = Meta::from(json!({"tag": 12}));
        DriverKind::Docker.finalize_meta(&mut meta);
        assert_eq!(meta.get("tag").unwrap(), "12");
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let dir = testing::pkr_root("containers: {}\n");
        let ctx = testing::context(&dir, json!({"tag": "1"}));
        let runner = Arc::new(MockRunner::new());

        let base = Driver::new(DriverKind::Base, runner.clone());
        let err = base.build(&ctx, &[], &BuildOptions::default()).await.unwrap_err();
        match err {
            DriverError::Unsupported { driver, operation } => {
                assert_eq!(driver, "base");
                assert_eq!(operation, "build");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let docker = Driver::new(DriverKind::Docker, runner.clone());
        let err = docker
            .deploy(&ctx, DeployAction::Start, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unsupported { .. }));
        assert!(docker.ps(&ctx).await.is_err());
        assert!(matches!(
            base.list_images(&ctx, &[], None),
            Err(DriverError::Unsupported { .. })
        ));
        assert!(runner.calls().is_empty());
    }
}

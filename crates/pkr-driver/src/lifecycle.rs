//! Kard lifecycle: create, update, make, build and deploy
//!
//! A [`Lifecycle`] ties the pkr root, the kard store, the plugin registry
//! and the collaborators together. Every operation loads the kard from
//! disk, so two calls never share in-memory state.

use chrono::Utc;
use pkr_core::{
    CoreError, Environment, KardRecord, KardStatus, KardStore, Meta, MetaSource, MetaStore,
    PkrRoot, SourceKind, StoredKard, deep_merge,
};
use pkr_engine::{ApplyReport, Engine, FileRenderer, RenderContext};
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::command::{CommandRunner, ProcessRunner};
use crate::context::KardContext;
use crate::driver::{
    BuildOptions, BuildReport, DRIVER_NAME_KEY, DeployAction, DeployReport, Driver, DriverKind,
    PurgeOptions, RegistryOptions,
};
use crate::error::{DriverError, Result};
use crate::features::{Registry, SetupContext, parse_feature_list, resolve_features};

/// Environment used when `kard create` is given none
pub const DEFAULT_ENV: &str = "dev";

/// Environment variable naming the kard to use instead of `current`
pub const KARD_ENV_VAR: &str = "PKR_KARD";

const FEATURES_KEY: &str = "features";
const SRC_PATH_KEY: &str = "src_path";

/// Command line inputs of `kard create` and `kard update`
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub env: Option<String>,
    pub driver: Option<String>,
    /// `--extra key=value` pairs
    pub extra: Meta,
    /// Content of the `--meta` file
    pub meta_file: Option<Meta>,
    pub features: Vec<String>,
}

pub struct Lifecycle<'r> {
    root: PkrRoot,
    store: KardStore,
    registry: &'r Registry,
    engine: Engine,
    runner: Arc<dyn CommandRunner>,
    cluster: Option<Arc<dyn Cluster>>,
}

impl<'r> Lifecycle<'r> {
    pub fn new(root: PkrRoot, registry: &'r Registry) -> Self {
        Self {
            store: KardStore::new(root.kard_dir()),
            root,
            registry,
            engine: Engine::new(),
            runner: Arc::new(ProcessRunner),
            cluster: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Use this cluster instead of connecting through the kubeconfig
    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn root(&self) -> &PkrRoot {
        &self.root
    }

    pub fn store(&self) -> &KardStore {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    fn driver(&self, kind: DriverKind) -> Driver {
        let driver = Driver::new(kind, Arc::clone(&self.runner));
        match &self.cluster {
            Some(cluster) => driver.with_cluster(Arc::clone(cluster)),
            None => driver,
        }
    }

    fn driver_for(&self, ctx: &KardContext) -> Result<Driver> {
        Ok(self.driver(DriverKind::from_meta(&ctx.meta)?))
    }

    // ========== Resolution ==========

    /// Compute the persisted state of a kard from its record
    ///
    /// Nothing is written; the kard directory must exist for plugins that
    /// fetch sources into it.
    pub fn resolve(&self, record: KardRecord) -> Result<StoredKard> {
        let kard_path = self.store.path(&record.name);
        let mut env = Environment::load(&self.root, &record.env)?;

        let mut meta_file = record.meta_file.clone();
        let meta_file_features = match &mut meta_file {
            JsonValue::Object(map) => map
                .remove(FEATURES_KEY)
                .map(|v| parse_feature_list(&v))
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let features: Vec<String> = resolve_features(
            env.import_features(),
            env.declared_features(),
            &meta_file_features,
            &record.features,
        )
        .into_iter()
        .map(|f| f.name)
        .collect();
        env.apply_features(&features)?;

        let mut extra = Meta::from(record.extra.clone());
        if let Some(driver) = &record.driver {
            extra.set(DRIVER_NAME_KEY, json!(driver));
        }

        let mut store = MetaStore::new();
        store.extend(env.meta_sources());
        store.push(MetaSource::new(SourceKind::CliMetaFile, meta_file).with_origin("--meta"));
        store.push(MetaSource::new(SourceKind::CliExtra, extra.inner().clone()).with_origin("--extra"));

        let preliminary = store.resolve()?;
        let kind = DriverKind::from_meta(&preliminary)?;
        let mut driver_meta = Meta::from(kind.get_meta(&record.name, &preliminary));
        driver_meta.set(DRIVER_NAME_KEY, json!(kind.name()));
        store.push(MetaSource::new(SourceKind::DriverGetMeta, driver_meta.into_inner()).with_origin(kind.name()));

        let mut preliminary = store.resolve()?;
        self.absolute_src_path(&mut preliminary, &kard_path);
        let setup = SetupContext {
            kard_name: &record.name,
            kard_path: &kard_path,
            env: &env,
            meta: &preliminary,
            extra: &extra,
        };
        store.extend(self.registry.setup_sources(&features, &setup)?);

        let mut meta = store.resolve()?;
        self.absolute_src_path(&mut meta, &kard_path);
        let final_kind = DriverKind::from_meta(&meta)?;
        if final_kind != kind {
            return Err(DriverError::InvalidConfig(format!(
                "features cannot change the driver: '{}' was selected before setup, '{}' after",
                kind.name(),
                final_kind.name()
            )));
        }

        let mut missing = meta.missing_keys(&env.required_meta());
        for key in meta.missing_keys(&kind.required_meta()) {
            if !missing.contains(&key) {
                missing.push(key);
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::MissingMeta { keys: missing }.into());
        }

        meta.set(FEATURES_KEY, json!(features));
        let mut meta = self.engine.render_meta(&meta)?;
        kind.finalize_meta(&mut meta);

        tracing::debug!(kard = %record.name, driver = kind.name(), features = ?features, "resolved kard");
        Ok(StoredKard {
            record,
            meta,
            features,
            driver: kind.name().to_string(),
        })
    }

    /// `src_path` defaults to `<kard>/src`; relative paths start at the pkr root
    fn absolute_src_path(&self, meta: &mut Meta, kard_path: &Path) {
        let src_path = match meta.get_str(SRC_PATH_KEY) {
            Some(path) if !path.is_empty() => self.root.resolve(path),
            _ => kard_path.join("src"),
        };
        meta.set(SRC_PATH_KEY, json!(src_path.to_string_lossy()));
    }

    // ========== Create / Update ==========

    /// Create and persist a new kard
    ///
    /// Any failure removes the new kard directory.
    pub fn create(&self, name: &str, overrides: Overrides) -> Result<StoredKard> {
        KardStore::validate_name(name)?;
        if self.store.exists(name) {
            return Err(CoreError::KardExists {
                name: name.to_string(),
            }
            .into());
        }

        let env = overrides.env.unwrap_or_else(|| DEFAULT_ENV.to_string());
        let mut record = KardRecord::new(name, env);
        record.driver = overrides.driver;
        record.extra = overrides.extra.into_inner();
        if let Some(meta_file) = overrides.meta_file {
            record.meta_file = meta_file.into_inner();
        }
        record.features = overrides.features;

        self.store.create_dir(name)?;
        let result = self.resolve(record).and_then(|kard| {
            self.store.save(&kard)?;
            Ok(kard)
        });
        match result {
            Ok(kard) => {
                tracing::info!(kard = name, env = %kard.record.env, driver = %kard.driver, "kard created");
                Ok(kard)
            }
            Err(err) => {
                if let Err(cleanup) = self.store.remove(name) {
                    tracing::warn!(kard = name, error = %cleanup, "failed to remove partial kard");
                }
                Err(err)
            }
        }
    }

    /// Layer new overrides over the stored ones and persist again
    ///
    /// The kard goes back to `created`. A failure leaves its files as they were.
    pub fn update(&self, name: &str, overrides: Overrides) -> Result<StoredKard> {
        let mut record = self.store.load(name)?.record;
        if let Some(env) = overrides.env {
            record.env = env;
        }
        if overrides.driver.is_some() {
            record.driver = overrides.driver;
        }
        deep_merge(&mut record.extra, overrides.extra.inner());
        if let Some(meta_file) = overrides.meta_file {
            deep_merge(&mut record.meta_file, meta_file.inner());
        }
        record.features.extend(overrides.features);
        record.status = KardStatus::Created;
        record.updated_at = Utc::now();

        let kard = self.resolve(record)?;
        self.store.save(&kard)?;
        tracing::info!(kard = name, "kard updated");
        Ok(kard)
    }

    // ========== Loading ==========

    /// A stored kard with its environment and features applied
    pub fn load(&self, name: &str) -> Result<KardContext> {
        let stored = self.store.load(name)?;
        let mut env = Environment::load(&self.root, &stored.record.env)?;
        env.apply_features(&stored.features)?;
        Ok(KardContext {
            root: self.root.clone(),
            env,
            name: name.to_string(),
            path: self.store.path(name),
            meta: stored.meta,
            features: stored.features,
        })
    }

    /// `PKR_KARD` when set, else the kard `current` points to
    pub fn current(&self) -> Result<String> {
        match std::env::var(KARD_ENV_VAR) {
            Ok(name) if !name.is_empty() => Ok(name),
            _ => Ok(self.store.current()?),
        }
    }

    pub fn set_current(&self, name: &str) -> Result<()> {
        self.store.set_current(name)?;
        tracing::info!(kard = name, "current kard changed");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.store.list()?)
    }

    /// Kards with a deployment state in the cluster
    pub async fn list_cluster(&self) -> Result<Vec<String>> {
        self.driver(DriverKind::K8s).list_deployed().await
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        if !self.store.exists(name) {
            return Err(CoreError::KardNotFound {
                name: name.to_string(),
            }
            .into());
        }
        self.store.remove(name)?;
        tracing::info!(kard = name, "kard removed");
        Ok(())
    }

    /// Meta as YAML; `cleaned` keeps only the values given on the command line
    pub fn dump(&self, name: &str, cleaned: bool) -> Result<String> {
        let stored = self.store.load(name)?;
        if !cleaned {
            return Ok(stored.meta.to_yaml()?);
        }
        let mut given = stored.record.meta_file.clone();
        deep_merge(&mut given, &stored.record.extra);
        Ok(Meta::from(given).to_yaml()?)
    }

    // ========== Make ==========

    /// Renderer with the kard helpers and the plugin functions
    pub fn renderer(&self, ctx: &KardContext) -> Result<FileRenderer> {
        let mut render = RenderContext::new(ctx.helpers()?).with_template_dir(ctx.env.template_dir());
        self.registry
            .extend_render_context(&ctx.features, ctx, &mut render)?;
        Ok(self.engine.file_renderer(&render))
    }

    fn make_context(&self, ctx: &KardContext, reset: bool) -> Result<ApplyReport> {
        let driver = self.driver_for(ctx)?;
        let renderer = self.renderer(ctx)?;
        let report = driver.plan(ctx, &renderer)?.apply(reset)?;
        self.registry.populate_kard(&ctx.features, ctx, &renderer)?;
        tracing::info!(
            kard = %ctx.name,
            written = report.written.len(),
            removed = report.removed.len(),
            "kard rendered"
        );
        Ok(report)
    }

    /// Render the driver outputs into the kard
    ///
    /// With `reset`, files no longer produced are removed from the
    /// directories the driver manages.
    pub fn make(&self, name: &str, reset: bool) -> Result<ApplyReport> {
        let ctx = self.load(name)?;
        let report = self.make_context(&ctx, reset)?;
        self.store.set_status(name, KardStatus::Rendered)?;
        Ok(report)
    }

    // ========== Images ==========

    pub async fn build(
        &self,
        name: &str,
        services: &[String],
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        let ctx = self.load(name)?;
        let report = self.driver_for(&ctx)?.build(&ctx, services, options).await?;
        self.store.set_status(name, KardStatus::Built)?;
        Ok(report)
    }

    pub async fn push(
        &self,
        name: &str,
        services: &[String],
        options: &RegistryOptions,
    ) -> Result<Vec<String>> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.push(&ctx, services, options).await
    }

    pub async fn pull(
        &self,
        name: &str,
        services: &[String],
        options: &RegistryOptions,
    ) -> Result<Vec<String>> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.pull(&ctx, services, options).await
    }

    pub fn list_images(&self, name: &str, services: &[String], tag: Option<&str>) -> Result<Vec<String>> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.list_images(&ctx, services, tag)
    }

    pub async fn purge(&self, name: &str, options: &PurgeOptions) -> Result<Vec<String>> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.purge(&ctx, options).await
    }

    // ========== Deploy ==========

    /// Start `services`, every service when empty
    ///
    /// Compose kards are made again first so the deployed file is current.
    pub async fn up(&self, name: &str, services: &[String]) -> Result<DeployReport> {
        let ctx = self.load(name)?;
        let driver = self.driver_for(&ctx)?;
        if driver.kind().makes_before_up() {
            self.make_context(&ctx, true)?;
        }
        self.start_with(&driver, &ctx, services).await
    }

    /// Start from the files already in the kard
    pub async fn start(&self, name: &str, services: &[String]) -> Result<DeployReport> {
        let ctx = self.load(name)?;
        let driver = self.driver_for(&ctx)?;
        self.start_with(&driver, &ctx, services).await
    }

    async fn start_with(
        &self,
        driver: &Driver,
        ctx: &KardContext,
        services: &[String],
    ) -> Result<DeployReport> {
        let report = driver.deploy(ctx, DeployAction::Start, services).await?;
        self.registry.post_up(&ctx.features, ctx, &report.services)?;
        self.store.set_status(&ctx.name, KardStatus::Deployed)?;
        Ok(report)
    }

    pub async fn down(&self, name: &str, services: &[String]) -> Result<DeployReport> {
        let ctx = self.load(name)?;
        let report = self
            .driver_for(&ctx)?
            .deploy(&ctx, DeployAction::Stop, services)
            .await?;
        self.store.set_status(name, KardStatus::Built)?;
        Ok(report)
    }

    pub async fn restart(&self, name: &str, services: &[String]) -> Result<()> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.restart(&ctx, services).await
    }

    pub async fn clean(&self, name: &str, kill: bool) -> Result<()> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.clean(&ctx, kill).await?;
        self.store.set_status(name, KardStatus::Built)?;
        Ok(())
    }

    pub async fn ps(&self, name: &str) -> Result<Vec<String>> {
        let ctx = self.load(name)?;
        self.driver_for(&ctx)?.ps(&ctx).await
    }

    /// Directory of a kard
    pub fn kard_path(&self, name: &str) -> PathBuf {
        self.store.path(name)
    }
}

//! pkr Driver - drivers, feature plugins and the kard lifecycle
//!
//! This crate provides:
//! - **Drivers**: base, docker, buildx, compose and k8s variants behind one
//!   capability table
//! - **Collaborators**: external tools run through a `CommandRunner`, the
//!   Kubernetes state kept through a `Cluster`
//! - **Features**: the plugin registry and the built-in plugins
//! - **Lifecycle**: create, update, make, build and deploy a kard
//! - **Retries**: bounded retry with backoff for transient tool failures

pub mod cluster;
pub mod command;
pub mod context;
pub mod diff;
pub mod driver;
pub mod error;
pub mod features;
pub mod lifecycle;
pub mod retry;

pub use cluster::{Cluster, DeployedFiles, KubeCluster, MockCluster, PodInfo};
pub use command::{CommandOutput, CommandRunner, Invocation, MockResponse, MockRunner, ProcessRunner};
pub use context::KardContext;
pub use diff::FileChange;
pub use driver::{
    BuildOptions, BuildReport, DeployAction, DeployReport, Driver, DriverKind, Operation,
    PurgeOptions, RegistryOptions,
};
pub use error::{DriverError, Result};
pub use features::{Feature, FeatureOrigin, Plugin, Registry, SetupContext};
pub use lifecycle::{Lifecycle, Overrides};
pub use retry::RetryPolicy;

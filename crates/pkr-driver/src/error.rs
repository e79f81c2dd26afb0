//! Error types for pkr-driver

use pkr_core::CoreError;
use pkr_engine::EngineError;
use thiserror::Error;

/// Result type for driver and lifecycle operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Stderr fragments of failures worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "tls handshake timeout",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
    "too many requests",
];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown driver '{name}' (available: {})", crate::driver::DriverKind::NAMES.join(", "))]
    UnknownDriver { name: String },

    #[error("driver '{driver}' does not support {operation}")]
    Unsupported { driver: String, operation: String },

    /// An external tool exited unsuccessfully
    #[error("`{} {}` failed ({}): {}", .tool, .args.join(" "), .status, .stderr.trim())]
    Collaborator {
        tool: String,
        args: Vec<String>,
        status: String,
        stderr: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("depends_on cycle between services: {chain}")]
    DependencyCycle { chain: String },

    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),

    #[error("feature '{plugin}' failed during {hook}: {source}")]
    Plugin {
        plugin: String,
        hook: &'static str,
        #[source]
        source: Box<DriverError>,
    },

    /// Independent builds failed; the others completed
    #[error("{} image build(s) failed: {}", .failures.len(), describe_failures(.failures))]
    BuildFailed { failures: Vec<(String, DriverError)> },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_failures(failures: &[(String, DriverError)]) -> String {
    failures
        .iter()
        .map(|(service, err)| format!("{service}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DriverError {
    /// Collaborator failure that may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            DriverError::Collaborator { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m))
            }
            _ => false,
        }
    }

    /// Innermost error, through plugin and build wrappers
    pub fn root(&self) -> &DriverError {
        match self {
            DriverError::Plugin { source, .. } => source.root(),
            DriverError::BuildFailed { failures } if failures.len() == 1 => failures[0].1.root(),
            other => other,
        }
    }

    pub fn plugin(plugin: &str, hook: &'static str, source: DriverError) -> Self {
        DriverError::Plugin {
            plugin: plugin.to_string(),
            hook,
            source: Box::new(source),
        }
    }

    pub fn unsupported(driver: impl Into<String>, operation: impl Into<String>) -> Self {
        DriverError::Unsupported {
            driver: driver.into(),
            operation: operation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collaborator(stderr: &str) -> DriverError {
        DriverError::Collaborator {
            tool: "docker".to_string(),
            args: vec!["push".to_string(), "api:1".to_string()],
            status: "exit status: 1".to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(collaborator("net/http: TLS handshake timeout").is_transient());
        assert!(collaborator("read: connection reset by peer").is_transient());
        assert!(collaborator("received unexpected HTTP status: 503 Service Unavailable").is_transient());
        assert!(collaborator("toomanyrequests: Too Many Requests").is_transient());

        assert!(!collaborator("unauthorized: authentication required").is_transient());
        assert!(!collaborator("invalid reference format").is_transient());
        assert!(!DriverError::Cancelled.is_transient());
    }

    #[test]
    fn test_collaborator_display() {
        let message = collaborator("denied\n").to_string();
        assert_eq!(message, "`docker push api:1` failed (exit status: 1): denied");
    }

    #[test]
    fn test_root_unwraps_plugin() {
        let err = DriverError::plugin("git", "setup", DriverError::Cancelled);
        assert!(matches!(err.root(), DriverError::Cancelled));
        assert!(err.to_string().contains("feature 'git' failed during setup"));
    }
}

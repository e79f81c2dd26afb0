//! Core error types

use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceKind;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid {kind} source (rank {rank}, {origin}): {message}")]
    InvalidSource {
        kind: SourceKind,
        rank: u8,
        origin: String,
        message: String,
    },

    #[error("import cycle detected: {chain}")]
    ImportCycle { chain: String },

    #[error("environment '{name}' not found: {path} does not exist")]
    EnvironmentNotFound { name: String, path: PathBuf },

    #[error("invalid environment file {path}: {message}")]
    InvalidEnvironment { path: PathBuf, message: String },

    #[error("no pkr root found from {path} (expected a directory containing env/<name>/env.yml)")]
    RootNotFound { path: PathBuf },

    #[error("missing required meta: {}", .keys.join(", "))]
    MissingMeta { keys: Vec<String> },

    #[error("invalid extra '{arg}': expected key=value")]
    InvalidExtra { arg: String },

    #[error("container '{name}' is not declared in environment '{env}'")]
    UnknownContainer { name: String, env: String },

    #[error("kard '{name}' not found")]
    KardNotFound { name: String },

    #[error("kard '{name}' already exists, use `pkr kard update` to change it")]
    KardExists { name: String },

    #[error("invalid kard name '{name}': {reason}")]
    InvalidKardName { name: String, reason: String },

    #[error("no current kard, create one or run `pkr kard load <name>`")]
    NoCurrentKard,

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True for I/O failures, false for configuration problems.
    pub fn is_io(&self) -> bool {
        matches!(self, CoreError::Io(_) | CoreError::ReadFile { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

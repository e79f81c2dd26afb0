//! CLI error type with exit code handling
//!
//! Every library error is classified into one kind, which decides the
//! process exit code and the one-line prefix printed on stderr.

use miette::Diagnostic;
use pkr_core::CoreError;
use pkr_driver::DriverError;
use pkr_engine::{EngineError, TemplateError};
use thiserror::Error;

use crate::exit_codes;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("{message}")]
    #[diagnostic(code(pkr::cli::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(TemplateError),

    #[error("{message}")]
    #[diagnostic(code(pkr::cli::unsupported))]
    Unsupported { message: String },

    #[error("{message}")]
    #[diagnostic(code(pkr::cli::io))]
    Io { message: String },

    #[error("{message}")]
    #[diagnostic(code(pkr::cli::collaborator))]
    Collaborator { message: String },

    #[error("operation cancelled")]
    #[diagnostic(code(pkr::cli::cancelled))]
    Cancelled,

    #[error("{message}")]
    #[diagnostic(code(pkr::cli::error))]
    Other { message: String },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Template(_) => exit_codes::TEMPLATE_ERROR,
            CliError::Unsupported { .. } => exit_codes::UNSUPPORTED_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Collaborator { .. } => exit_codes::COLLABORATOR_ERROR,
            CliError::Cancelled => exit_codes::CANCELLED,
            CliError::Other { .. } => exit_codes::ERROR,
        }
    }

    /// Short classification printed before the message
    pub fn kind(&self) -> &'static str {
        match self {
            CliError::Config { .. } => "config",
            CliError::Template(_) => "template",
            CliError::Unsupported { .. } => "unsupported",
            CliError::Io { .. } => "io",
            CliError::Collaborator { .. } => "collaborator",
            CliError::Cancelled => "cancelled",
            CliError::Other { .. } => "error",
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }
}

fn help_for(err: &CoreError) -> Option<String> {
    match err {
        CoreError::MissingMeta { .. } => {
            Some("set them with --extra key=value, a --meta file or the environment's default_meta".to_string())
        }
        CoreError::RootNotFound { .. } => {
            Some("run `pkr init <path>` or point --pkr-path (PKR_PATH) at a pkr tree".to_string())
        }
        CoreError::NoCurrentKard => Some("pass --kard (PKR_KARD) to select one".to_string()),
        _ => None,
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        if err.is_io() {
            return CliError::Io {
                message: err.to_string(),
            };
        }
        CliError::Config {
            help: help_for(&err),
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for CliError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Template(te) => CliError::Template(te),
            other if other.is_config() => CliError::config(other.to_string()),
            other => CliError::Io {
                message: other.to_string(),
            },
        }
    }
}

impl From<DriverError> for CliError {
    fn from(err: DriverError) -> Self {
        let message = err.to_string();
        match err {
            DriverError::Core(e) => e.into(),
            DriverError::Engine(e) => e.into(),
            DriverError::BuildFailed { ref failures }
                if failures
                    .iter()
                    .all(|(_, e)| matches!(e.root(), DriverError::Cancelled)) =>
            {
                CliError::Cancelled
            }
            DriverError::BuildFailed { .. } => CliError::Collaborator { message },
            other => CliError::classify(other.root()).with_message(message),
        }
    }
}

impl CliError {
    /// Kind of an unwrapped driver error; the message is set by the caller
    fn classify(err: &DriverError) -> Self {
        let message = String::new();
        match err {
            DriverError::Core(e) if e.is_io() => CliError::Io { message },
            DriverError::Core(e) => CliError::Config {
                message,
                help: help_for(e),
            },
            DriverError::Engine(EngineError::Template(te)) => CliError::Template(te.clone()),
            DriverError::Engine(e) if e.is_config() => CliError::config(message),
            DriverError::Engine(_) => CliError::Io { message },
            DriverError::UnknownDriver { .. }
            | DriverError::InvalidConfig(_)
            | DriverError::DependencyCycle { .. }
            | DriverError::Yaml(_) => CliError::config(message),
            DriverError::Unsupported { .. } => CliError::Unsupported { message },
            DriverError::Cancelled => CliError::Cancelled,
            DriverError::Io(_) => CliError::Io { message },
            _ => CliError::Collaborator { message },
        }
    }

    fn with_message(self, message: String) -> Self {
        match self {
            CliError::Config { help, .. } => CliError::Config { message, help },
            CliError::Unsupported { .. } => CliError::Unsupported { message },
            CliError::Io { .. } => CliError::Io { message },
            CliError::Collaborator { .. } => CliError::Collaborator { message },
            CliError::Other { .. } => CliError::Other { message },
            keep => keep,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<miette::Report> for CliError {
    fn from(err: miette::Report) -> Self {
        CliError::Other {
            message: format!("{:?}", err),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

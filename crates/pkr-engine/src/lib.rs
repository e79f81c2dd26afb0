//! pkr Engine - meta and file rendering
//!
//! This crate provides a MiniJinja-based engine with:
//! - two-pass rendering of templated meta values
//! - kard helper functions and filters for template files
//! - render plans that copy and render trees into a kard
//! - readable errors with "did you mean" suggestions

pub mod engine;
pub mod error;
pub mod filters;
pub mod functions;
pub mod suggestions;
pub mod tree;

pub use engine::{Engine, EngineBuilder, FileRenderer, FunctionRegistrar, RenderContext};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
pub use functions::KardHelpers;
pub use tree::{ApplyReport, CopyRule, RenderPlan, SourceBase};

//! Engine error types

use miette::{Diagnostic, NamedSource, SourceSpan};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use thiserror::Error;

use crate::suggestions::{
    extract_quoted_name, suggest_undefined_variable, suggest_unknown_filter,
    suggest_unknown_function,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("output path conflict: {path} is produced twice with different content")]
    OutputConflict { path: PathBuf },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("source {path} does not exist")]
    MissingSource { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// True for problems in the input data rather than the filesystem
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            EngineError::OutputConflict { .. }
                | EngineError::InvalidPattern { .. }
                | EngineError::MissingSource { .. }
                | EngineError::Yaml(_)
                | EngineError::Json(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateErrorKind {
    UndefinedVariable,
    UnknownFilter,
    UnknownFunction,
    SyntaxError,
    TypeError,
    InvalidOperation,
    /// A meta value still holds a placeholder after the extra pass
    UnstableReference,
    Other,
}

impl TemplateErrorKind {
    pub fn to_code_string(&self) -> &'static str {
        match self {
            Self::UndefinedVariable => "undefined_variable",
            Self::UnknownFilter => "unknown_filter",
            Self::UnknownFunction => "unknown_function",
            Self::SyntaxError => "syntax",
            Self::TypeError => "type",
            Self::InvalidOperation => "invalid_operation",
            Self::UnstableReference => "unstable_reference",
            Self::Other => "render",
        }
    }
}

/// Template failure with the source it happened in
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{name}: {message}")]
#[diagnostic(code(pkr::template::render))]
pub struct TemplateError {
    pub message: String,

    pub kind: TemplateErrorKind,

    /// Template file, or `meta:<key>` for meta values
    pub name: String,

    #[source_code]
    pub src: NamedSource<String>,

    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    #[help]
    pub suggestion: Option<String>,
}

impl TemplateError {
    /// Build from a MiniJinja error; `context` feeds the suggestions
    pub fn from_minijinja(
        err: minijinja::Error,
        name: &str,
        source: &str,
        context: Option<&serde_json::Value>,
    ) -> Self {
        let kind = categorize(&err);
        let detailed = format!("{:#}", err);
        let expression = error_line_expression(&detailed).or_else(|| {
            err.line()
                .and_then(|line| unresolved_expression(source, line, context))
        });

        let message = match (kind, &expression) {
            (TemplateErrorKind::UndefinedVariable, Some(expr)) => {
                format!("undefined variable `{}` in `{{{{ {} }}}}`", head(expr), expr)
            }
            _ => err
                .to_string()
                .replace("undefined value", "undefined variable"),
        };

        let suggestion = match kind {
            TemplateErrorKind::UndefinedVariable => expression
                .as_deref()
                .and_then(|e| suggest_undefined_variable(head(e), context)),
            TemplateErrorKind::UnknownFilter => expression
                .as_deref()
                .and_then(filter_of)
                .or_else(|| extract_quoted_name(&err.to_string()))
                .map(|f| suggest_unknown_filter(&f)),
            TemplateErrorKind::UnknownFunction => {
                extract_quoted_name(&err.to_string()).map(|f| suggest_unknown_function(&f))
            }
            TemplateErrorKind::SyntaxError => Some(
                "Check bracket matching: `{{ }}` for expressions, `{% %}` for statements"
                    .to_string(),
            ),
            _ => None,
        };

        let span = err.line().and_then(|line| line_span(source, line));

        Self {
            message,
            kind,
            name: name.to_string(),
            src: NamedSource::new(name, source.to_string()),
            span,
            suggestion,
        }
    }

    /// Meta value that needs more than one extra pass
    pub fn unstable(key: &str, value: &str, placeholder: &str) -> Self {
        Self {
            message: format!(
                "meta value does not stabilize, `{placeholder}` is still unresolved after two passes"
            ),
            kind: TemplateErrorKind::UnstableReference,
            name: format!("meta:{key}"),
            src: NamedSource::new(format!("meta:{key}"), value.to_string()),
            span: value
                .find(placeholder)
                .map(|offset| SourceSpan::new(offset.into(), placeholder.len())),
            suggestion: Some(
                "A value may reference a value that is itself templated, but not itself nor a longer chain"
                    .to_string(),
            ),
        }
    }

    pub fn simple(name: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TemplateErrorKind::Other,
            name: name.to_string(),
            src: NamedSource::new(name, String::new()),
            span: None,
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

fn categorize(err: &minijinja::Error) -> TemplateErrorKind {
    use minijinja::ErrorKind;

    match err.kind() {
        ErrorKind::UndefinedError => TemplateErrorKind::UndefinedVariable,
        ErrorKind::UnknownFilter => TemplateErrorKind::UnknownFilter,
        ErrorKind::UnknownFunction => TemplateErrorKind::UnknownFunction,
        ErrorKind::SyntaxError => TemplateErrorKind::SyntaxError,
        ErrorKind::InvalidOperation => TemplateErrorKind::InvalidOperation,
        ErrorKind::NonPrimitive | ErrorKind::NonKey => TemplateErrorKind::TypeError,
        _ => {
            let msg = err.to_string().to_lowercase();
            if msg.contains("undefined") {
                TemplateErrorKind::UndefinedVariable
            } else if msg.contains("not iterable") || msg.contains("cannot") {
                TemplateErrorKind::TypeError
            } else {
                TemplateErrorKind::Other
            }
        }
    }
}

/// Expression inside `{{ }}` on the line MiniJinja marks with `>`
fn error_line_expression(detailed: &str) -> Option<String> {
    let line = detailed
        .lines()
        .find(|l| l.trim_start().contains(" > ") || l.trim_start().starts_with("> "))?;
    let start = line.find("{{")?;
    let end = line[start..].find("}}")?;
    let expr = line[start + 2..start + end].trim();
    (!expr.is_empty()).then(|| expr.to_string())
}

static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("valid regex"));

/// First expression on a source line whose variable is not in the context
fn unresolved_expression(
    source: &str,
    line: usize,
    context: Option<&serde_json::Value>,
) -> Option<String> {
    let text = source.lines().nth(line.checked_sub(1)?)?;
    EXPRESSION
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .find(|expr| match context {
            Some(ctx) => pkr_core::lookup(ctx, head(expr)).is_none(),
            None => true,
        })
}

/// Variable part of an expression, before any filter or call
fn head(expr: &str) -> &str {
    expr.split(['|', '('])
        .next()
        .unwrap_or(expr)
        .trim()
}

fn filter_of(expr: &str) -> Option<String> {
    let (_, filter) = expr.rsplit_once('|')?;
    filter
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn line_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;
    for (idx, line) in source.split('\n').enumerate() {
        if idx + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }
    None
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_line_expression() {
        let display = "
   3 >   url: {{ deployment_ur | upper }}
     i            ^^^^^^^^^^^^^ undefined value
";
        assert_eq!(
            error_line_expression(display),
            Some("deployment_ur | upper".to_string())
        );
        assert_eq!(head("deployment_ur | upper"), "deployment_ur");
        assert_eq!(filter_of("name | toyml"), Some("toyml".to_string()));
    }

    #[test]
    fn test_unresolved_expression() {
        let ctx = serde_json::json!({"tag": "1.0"});
        let source = "a: 1\nimage: {{ tag }}:{{ registy }}\n";
        assert_eq!(
            unresolved_expression(source, 2, Some(&ctx)),
            Some("registy".to_string())
        );
        assert_eq!(unresolved_expression(source, 1, Some(&ctx)), None);
    }

    #[test]
    fn test_line_span() {
        let span = line_span("a: 1\nb: {{ x }}\n", 2).unwrap();
        assert_eq!(span.offset(), 5);
        assert_eq!(span.len(), 10);
        assert!(line_span("a: 1", 4).is_none());
    }

    #[test]
    fn test_unstable_names_key_and_placeholder() {
        let err = TemplateError::unstable("a", "{{ a }}", "{{ a }}");
        assert_eq!(err.kind(), TemplateErrorKind::UnstableReference);
        let message = err.to_string();
        assert!(message.contains("meta:a"));
        assert!(message.contains("{{ a }}"));
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(
            TemplateErrorKind::UnstableReference.to_code_string(),
            "unstable_reference"
        );
        assert_eq!(TemplateErrorKind::SyntaxError.to_code_string(), "syntax");
    }
}

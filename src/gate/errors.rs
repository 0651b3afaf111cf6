use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::policy::errors::{BindError, EvalError, LoadError};

/// Structural problems in the directive or structured configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read directive file `{path}`")]
    #[diagnostic(code(portcullis::config::read))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Syntax(#[from] kdl::KdlError),

    #[error("line {line}: `{directive}` does not take properties, found `{key}`")]
    #[diagnostic(
        code(portcullis::config::unexpected_property),
        help("Directive arguments are positional, e.g. `bundle \"./bundle\"`")
    )]
    UnexpectedProperty {
        directive: String,
        key: String,
        line: usize,
    },

    #[error("line {line}: unrecognized directive `{directive}`")]
    #[diagnostic(code(portcullis::config::unrecognized_directive))]
    UnrecognizedDirective { directive: String, line: usize },

    #[error("line {line}: `{directive}` expects {expected}, got {found} argument(s)")]
    #[diagnostic(code(portcullis::config::arguments))]
    WrongArgumentCount {
        directive: String,
        line: usize,
        expected: &'static str,
        found: usize,
    },

    #[error("line {line}: `{directive}` does not take a block")]
    #[diagnostic(code(portcullis::config::unexpected_block))]
    UnexpectedBlock { directive: String, line: usize },

    #[error("line {line}: `{directive}` given more than once")]
    #[diagnostic(code(portcullis::config::duplicate))]
    Duplicate { directive: String, line: usize },

    #[error("line {line}: `policy` needs exactly one source")]
    #[diagnostic(
        code(portcullis::config::policy_source),
        help("Use `policy <file>` or a block with one of `bundle`, `file` or `inline`")
    )]
    PolicySource { line: usize },

    #[error("line {line}: invalid value `{value}` for `{directive}`")]
    #[diagnostic(code(portcullis::config::invalid_value))]
    InvalidValue {
        directive: String,
        value: String,
        line: usize,
    },

    #[error("Unknown output stream `{0}`")]
    #[diagnostic(
        code(portcullis::config::output_stream),
        help("Supported output streams: stdout, stderr")
    )]
    UnknownOutputStream(String),

    #[error("Invalid identity header name `{0}`")]
    #[diagnostic(code(portcullis::config::header_name))]
    InvalidHeaderName(String),

    #[error("Handler chain is configured twice (both `directives` and inline settings)")]
    #[diagnostic(
        code(portcullis::config::conflicting_sources),
        help("Configure the chain either through a directive file or through the [gate] table, not both")
    )]
    ConflictingSources,
}

/// Any failure while bringing a gate from configuration to serving.
/// A gate that fails setup is never installed in the chain.
#[derive(Debug, Error, Diagnostic)]
pub enum SetupError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bind(#[from] BindError),
}

/// Per-request rejection. Every variant renders the same unauthorized
/// response; the variants only differ in what gets logged.
#[derive(Debug, Error, Diagnostic)]
pub enum AuthorizationError {
    #[error("policy evaluation failed")]
    #[diagnostic(code(portcullis::authz::evaluation_fault))]
    EvaluationFault(#[source] EvalError),

    #[error("decision is undefined")]
    #[diagnostic(code(portcullis::authz::undefined))]
    Undefined,

    #[error("request denied by policy")]
    #[diagnostic(code(portcullis::authz::denied))]
    Denied,

    #[error("request path `{0}` does not decode to UTF-8")]
    #[diagnostic(code(portcullis::authz::malformed_path))]
    MalformedPath(String),
}

impl AuthorizationError {
    pub fn status(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthorizationError {
    fn into_response(self) -> Response {
        match &self {
            AuthorizationError::EvaluationFault(cause) => {
                tracing::error!(error = %cause, "Policy evaluation fault");
            }
            AuthorizationError::Undefined
            | AuthorizationError::Denied
            | AuthorizationError::MalformedPath(_) => {
                tracing::debug!(reason = %self, "Request rejected");
            }
        }
        let body = json!({ "error": "unauthorized" });
        (self.status(), Json(body)).into_response()
    }
}

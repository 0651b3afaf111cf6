use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Failure inside the condition expression language, either while parsing
/// a condition or while evaluating it against a document.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq)]
pub enum ConditionError {
    #[error("invalid condition expression: {0}")]
    #[diagnostic(
        code(portcullis::policy::condition_syntax),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in. References start at `input` or `data` (e.g. input.path[0])")
    )]
    Syntax(String),

    #[error("condition evaluation failed: {0}")]
    #[diagnostic(code(portcullis::policy::condition_eval))]
    Evaluation(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("Failed to read policy source `{path}`")]
    #[diagnostic(
        code(portcullis::policy::read),
        help("Check that the file exists and is readable by the gateway process")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Policy bundle `{0}` does not exist or is not a directory")]
    #[diagnostic(
        code(portcullis::policy::bundle_missing),
        help("Bundles are directories of `.kdl` modules plus optional `data.json` documents")
    )]
    BundleNotFound(String),

    #[error("Policy bundle `{0}` contains no `.kdl` modules")]
    #[diagnostic(code(portcullis::policy::bundle_empty))]
    EmptyBundle(String),

    #[error("KDL parse error in `{origin}`: {message}")]
    #[diagnostic(
        code(portcullis::policy::kdl_parse),
        help("Check the module syntax against https://kdl.dev")
    )]
    KdlParse { origin: String, message: String },

    #[error("Invalid policy module `{origin}`: {message}")]
    #[diagnostic(
        code(portcullis::policy::invalid_module),
        help("Each module needs one `package \"a.b\"` node followed by `rule` and `default` nodes")
    )]
    InvalidModule { origin: String, message: String },

    #[error("Invalid condition in rule `{rule}` of `{origin}`")]
    #[diagnostic(code(portcullis::policy::invalid_condition))]
    Condition {
        origin: String,
        rule: String,
        #[source]
        #[diagnostic_source]
        source: ConditionError,
    },

    #[error("Multiple defaults declared for rule `{rule}` in package `{package}`")]
    #[diagnostic(code(portcullis::policy::duplicate_default))]
    DuplicateDefault { package: String, rule: String },

    #[error("Invalid data document `{path}`")]
    #[diagnostic(
        code(portcullis::policy::invalid_data),
        help("Data documents must be JSON objects")
    )]
    InvalidData {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Data document `{path}` conflicts with existing data at `{key}`")]
    #[diagnostic(code(portcullis::policy::data_conflict))]
    DataConflict { path: String, key: String },
}

#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum BindError {
    #[error("Invalid decision path `{0}`")]
    #[diagnostic(
        code(portcullis::policy::invalid_query),
        help("Decision paths look like `data.system.authz.allow`: a package followed by a rule name")
    )]
    InvalidPath(String),

    #[error("Decision path `{path}` refers to undefined package `{package}`")]
    #[diagnostic(code(portcullis::policy::undefined_package))]
    UndefinedPackage { path: String, package: String },

    #[error("Decision path `{path}` refers to undefined rule `{rule}` in package `{package}`")]
    #[diagnostic(code(portcullis::policy::undefined_rule))]
    UndefinedRule {
        path: String,
        package: String,
        rule: String,
    },
}

/// Engine-level failure while evaluating a prepared query.
#[derive(Debug, Error, Diagnostic)]
pub enum EvalError {
    #[error("rule `{rule}` failed to evaluate")]
    #[diagnostic(code(portcullis::policy::eval))]
    Condition {
        rule: String,
        #[source]
        source: ConditionError,
    },

    #[error("evaluation was cancelled")]
    #[diagnostic(code(portcullis::policy::cancelled))]
    Cancelled,

    #[error("evaluation exceeded {0:?}")]
    #[diagnostic(code(portcullis::policy::timeout))]
    TimedOut(Duration),

    #[error("evaluation task aborted: {0}")]
    #[diagnostic(code(portcullis::policy::aborted))]
    Aborted(String),
}

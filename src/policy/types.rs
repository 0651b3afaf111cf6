use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::policy::condition::Expr;

/// Where a gate's policy source comes from.
///
/// Deserializes from `{ kind = "bundle", location = "./bundle" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum PolicyReference {
    /// Module source text, compiled as-is.
    Inline(String),
    /// Path to a single module file.
    File(PathBuf),
    /// Directory of modules plus optional `data.json` documents.
    Bundle(PathBuf),
}

impl PolicyReference {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyReference::Inline(_) => "inline",
            PolicyReference::File(_) => "file",
            PolicyReference::Bundle(_) => "bundle",
        }
    }
}

impl fmt::Display for PolicyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyReference::Inline(src) => write!(f, "inline ({} bytes)", src.len()),
            PolicyReference::File(path) => write!(f, "file {}", path.display()),
            PolicyReference::Bundle(path) => write!(f, "bundle {}", path.display()),
        }
    }
}

// ---------- Module domain types ----------

/// A `rule` node: its body is the conjunction of its conditions.
#[derive(Debug, Clone)]
pub struct RuleDef {
    pub name: String,
    /// Raw condition expressions, compiled on load
    pub conditions: Vec<String>,
}

/// Intermediate result from parsing a single KDL module.
#[derive(Debug, Clone, Default)]
pub struct ParsedModule {
    /// File path or `<inline>`, for error messages
    pub origin: String,
    pub package: String,
    pub rules: Vec<RuleDef>,
    /// Rule names declared with `default`
    pub defaults: Vec<String>,
}

/// All bodies of one rule within a package, across every module.
#[derive(Debug, Clone, Default)]
pub struct CompiledRule {
    /// Each body is a list of conditions that must all hold
    pub bodies: Vec<Vec<Expr>>,
    /// Value when no body holds; `None` leaves the rule undefined
    pub default: Option<bool>,
}

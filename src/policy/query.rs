use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::policy::condition::{self, Bindings};
use crate::policy::errors::{BindError, EvalError};
use crate::policy::CompiledPolicy;

/// Decision path consulted when none is configured.
pub const DEFAULT_QUERY: &str = "data.system.authz.allow";

/// Outcome of evaluating a prepared query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The rule produced a value.
    Value(bool),
    /// No body held and the rule has no default.
    Undefined,
}

/// A decision path resolved against a compiled policy. Evaluation only reads
/// shared state, so one prepared query serves any number of concurrent callers.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    policy: Arc<CompiledPolicy>,
    path: String,
    package: String,
    rule: String,
}

impl PreparedQuery {
    /// Resolve `path` (e.g. `data.system.authz.allow`) against `policy`.
    /// Unknown packages and rules are rejected here rather than at evaluation.
    pub fn bind(policy: Arc<CompiledPolicy>, path: &str) -> Result<Self, BindError> {
        let trimmed = path.strip_prefix("data.").unwrap_or(path);
        let (package, rule) = trimmed
            .rsplit_once('.')
            .filter(|(package, rule)| {
                !rule.is_empty() && package.split('.').all(|seg| !seg.is_empty())
            })
            .ok_or_else(|| BindError::InvalidPath(path.to_string()))?;

        let Some(rules) = policy.packages.get(package) else {
            return Err(BindError::UndefinedPackage {
                path: path.to_string(),
                package: package.to_string(),
            });
        };
        if !rules.contains_key(rule) {
            return Err(BindError::UndefinedRule {
                path: path.to_string(),
                package: package.to_string(),
                rule: rule.to_string(),
            });
        }

        tracing::debug!(path, package, rule, "Bound decision path");

        Ok(Self {
            package: package.to_string(),
            rule: rule.to_string(),
            path: path.to_string(),
            policy,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn policy(&self) -> &Arc<CompiledPolicy> {
        &self.policy
    }

    /// Evaluate the bound rule against `input`. The token is checked before
    /// every body and every condition; a cancelled token aborts evaluation.
    pub fn eval(&self, input: &Value, cancel: &CancellationToken) -> Result<Decision, EvalError> {
        let Some(rule) = self.policy.rule(&self.package, &self.rule) else {
            return Ok(Decision::Undefined);
        };
        let bindings = Bindings {
            input,
            data: &self.policy.data,
        };

        'bodies: for body in &rule.bodies {
            for cond in body {
                if cancel.is_cancelled() {
                    return Err(EvalError::Cancelled);
                }
                let holds =
                    condition::evaluate(cond, &bindings).map_err(|source| EvalError::Condition {
                        rule: self.rule.clone(),
                        source,
                    })?;
                if !holds {
                    continue 'bodies;
                }
            }
            if cancel.is_cancelled() {
                return Err(EvalError::Cancelled);
            }
            return Ok(Decision::Value(true));
        }

        Ok(rule.default.map_or(Decision::Undefined, Decision::Value))
    }
}

impl fmt::Display for PreparedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data.{}.{}", self.package, self.rule)
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::directive::{self, Directive};
use crate::gate::errors::ConfigError;
use crate::gate::input::IdentityStrategy;
use crate::policy::query::DEFAULT_QUERY;
use crate::policy::types::PolicyReference;
use crate::remote_addr::OutputStream;

fn default_query() -> String {
    DEFAULT_QUERY.to_string()
}

fn default_eval_timeout_ms() -> u64 {
    1000
}

/// Everything needed to provision one policy gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub policy: PolicyReference,
    #[serde(default)]
    pub identity: IdentityStrategy,
    /// Decision path, with or without the `data.` prefix
    #[serde(default = "default_query")]
    pub query: String,
    /// Per-request evaluation budget; 0 disables the timeout
    #[serde(default = "default_eval_timeout_ms")]
    pub eval_timeout_ms: u64,
}

impl GateConfig {
    pub fn new(policy: PolicyReference) -> Self {
        Self {
            policy,
            identity: IdentityStrategy::default(),
            query: default_query(),
            eval_timeout_ms: default_eval_timeout_ms(),
        }
    }

    pub fn eval_timeout(&self) -> Option<Duration> {
        (self.eval_timeout_ms > 0).then(|| Duration::from_millis(self.eval_timeout_ms))
    }

    /// Build from a `policy` directive, either `policy <file>` or a block.
    pub fn from_directive(d: &Directive) -> Result<Self, ConfigError> {
        match (d.args.as_slice(), &d.block) {
            ([file], None) => Ok(Self::new(PolicyReference::File(PathBuf::from(file)))),
            ([], Some(block)) => Self::from_block(d, block),
            ([_], Some(_)) => Err(ConfigError::UnexpectedBlock {
                directive: d.name.clone(),
                line: d.line,
            }),
            (args, _) => Err(ConfigError::WrongArgumentCount {
                directive: d.name.clone(),
                line: d.line,
                expected: "one policy file or a block",
                found: args.len(),
            }),
        }
    }

    fn from_block(parent: &Directive, block: &[Directive]) -> Result<Self, ConfigError> {
        let mut source: Option<PolicyReference> = None;
        let mut identity = None;
        let mut query = None;
        let mut eval_timeout_ms = None;

        for sub in block {
            match sub.name.as_str() {
                "bundle" | "file" | "inline" => {
                    let arg = sub.single_arg()?;
                    if source.is_some() {
                        return Err(ConfigError::PolicySource { line: sub.line });
                    }
                    source = Some(match sub.name.as_str() {
                        "bundle" => PolicyReference::Bundle(PathBuf::from(arg)),
                        "file" => PolicyReference::File(PathBuf::from(arg)),
                        _ => PolicyReference::Inline(arg.to_string()),
                    });
                }
                "identity" => {
                    set_once(&mut identity, sub, parse_identity(sub)?)?;
                }
                "query" => {
                    let path = sub.single_arg()?.to_string();
                    set_once(&mut query, sub, path)?;
                }
                "eval_timeout" => {
                    let millis = parse_millis(sub)?;
                    set_once(&mut eval_timeout_ms, sub, millis)?;
                }
                other => {
                    return Err(ConfigError::UnrecognizedDirective {
                        directive: other.to_string(),
                        line: sub.line,
                    })
                }
            }
        }

        let policy = source.ok_or(ConfigError::PolicySource { line: parent.line })?;
        Ok(Self {
            policy,
            identity: identity.unwrap_or_default(),
            query: query.unwrap_or_else(default_query),
            eval_timeout_ms: eval_timeout_ms.unwrap_or_else(default_eval_timeout_ms),
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, d: &Directive, value: T) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Err(ConfigError::Duplicate {
            directive: d.name.clone(),
            line: d.line,
        });
    }
    *slot = Some(value);
    Ok(())
}

fn parse_identity(d: &Directive) -> Result<IdentityStrategy, ConfigError> {
    d.reject_block()?;
    match d.args.as_slice() {
        [kind] if kind == "bearer" => Ok(IdentityStrategy::Bearer),
        [kind] if kind == "header" => Ok(IdentityStrategy::Header {
            name: crate::gate::input::DEFAULT_IDENTITY_HEADER.to_string(),
        }),
        [kind, name] if kind == "header" => Ok(IdentityStrategy::header(name.as_str())),
        [kind] | [kind, _] => Err(ConfigError::InvalidValue {
            directive: d.name.clone(),
            value: kind.clone(),
            line: d.line,
        }),
        args => Err(ConfigError::WrongArgumentCount {
            directive: d.name.clone(),
            line: d.line,
            expected: "`bearer` or `header [name]`",
            found: args.len(),
        }),
    }
}

/// Accepts `500` or `500ms`.
fn parse_millis(d: &Directive) -> Result<u64, ConfigError> {
    let raw = d.single_arg()?;
    raw.strip_suffix("ms")
        .unwrap_or(raw)
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            directive: d.name.clone(),
            value: raw.to_string(),
            line: d.line,
        })
}

/// The handlers a deployment installs in front of the upstream, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub remote_addr: Option<OutputStream>,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

impl ChainConfig {
    pub fn is_empty(&self) -> bool {
        self.remote_addr.is_none() && self.gate.is_none()
    }
}

/// Parse a directive file into a chain configuration.
pub fn parse_directives(src: &str) -> Result<ChainConfig, ConfigError> {
    let mut chain = ChainConfig::default();

    for d in directive::parse(src)? {
        match d.name.as_str() {
            "policy" => {
                let gate = GateConfig::from_directive(&d)?;
                set_once(&mut chain.gate, &d, gate)?;
            }
            "remote_addr" => {
                let stream = d.single_arg()?.parse::<OutputStream>()?;
                set_once(&mut chain.remote_addr, &d, stream)?;
            }
            other => {
                return Err(ConfigError::UnrecognizedDirective {
                    directive: other.to_string(),
                    line: d.line,
                })
            }
        }
    }

    Ok(chain)
}

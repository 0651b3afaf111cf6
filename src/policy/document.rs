use kdl::{KdlDocument, KdlNode};

use crate::policy::errors::LoadError;
use crate::policy::types::*;

/// Parse a KDL module into typed policy structs. `origin` names the source
/// (a file path, or `<inline>`) in error messages.
pub fn parse_kdl_document(source: &str, origin: &str) -> Result<ParsedModule, LoadError> {
    let doc: KdlDocument = source.parse().map_err(|e: kdl::KdlError| LoadError::KdlParse {
        origin: origin.to_string(),
        message: e.to_string(),
    })?;

    let invalid = |message: String| LoadError::InvalidModule {
        origin: origin.to_string(),
        message,
    };

    let mut package: Option<String> = None;
    let mut module = ParsedModule {
        origin: origin.to_string(),
        ..Default::default()
    };

    for node in doc.nodes() {
        match node.name().value() {
            "package" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    invalid(
                        "package node requires a string argument (e.g. package \"system.authz\")"
                            .into(),
                    )
                })?;
                if !is_dotted_name(&name) {
                    return Err(invalid(format!(
                        "invalid package name `{name}` (expected dot-separated identifiers)"
                    )));
                }
                if let Some(existing) = &package {
                    return Err(invalid(format!(
                        "package declared twice (`{existing}` and `{name}`)"
                    )));
                }
                package = Some(name);
            }
            "rule" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    invalid("rule node requires a string argument (e.g. rule \"allow\")".into())
                })?;

                let mut conditions = Vec::new();
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "condition" => {
                                let expr = first_string_arg(child).ok_or_else(|| {
                                    invalid(format!(
                                        "condition in rule `{name}` requires a string argument"
                                    ))
                                })?;
                                conditions.push(expr);
                            }
                            other => {
                                return Err(invalid(format!(
                                    "unexpected child `{other}` in rule `{name}` (expected `condition`)"
                                )));
                            }
                        }
                    }
                }

                module.rules.push(RuleDef { name, conditions });
            }
            "default" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    invalid(
                        "default node requires a rule name argument (e.g. default \"allow\")"
                            .into(),
                    )
                })?;
                module.defaults.push(name);
            }
            other => {
                tracing::warn!(origin, "ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    module.package = package.ok_or_else(|| invalid("missing `package` node".into()))?;
    Ok(module)
}

fn is_dotted_name(name: &str) -> bool {
    name.split('.').all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

//! Directive files are KDL documents: each node is a directive, its
//! positional arguments are the directive arguments and its children block
//! holds nested directives.
//!
//! ```kdl
//! // gateway
//! remote_addr stderr
//! policy {
//!     bundle "./policies/prod bundle"
//!     identity header X-Auth-Bearer
//!     eval_timeout 500
//! }
//! ```

use kdl::{KdlDocument, KdlNode, KdlValue};

use crate::gate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub line: usize,
    pub args: Vec<String>,
    pub block: Option<Vec<Directive>>,
}

impl Directive {
    /// Exactly one argument and no block.
    pub fn single_arg(&self) -> Result<&str, ConfigError> {
        self.reject_block()?;
        match self.args.as_slice() {
            [arg] => Ok(arg),
            args => Err(ConfigError::WrongArgumentCount {
                directive: self.name.clone(),
                line: self.line,
                expected: "exactly one argument",
                found: args.len(),
            }),
        }
    }

    pub fn reject_block(&self) -> Result<(), ConfigError> {
        if self.block.is_some() {
            return Err(ConfigError::UnexpectedBlock {
                directive: self.name.clone(),
                line: self.line,
            });
        }
        Ok(())
    }
}

/// Parse directive source into a tree of directives.
pub fn parse(src: &str) -> Result<Vec<Directive>, ConfigError> {
    let doc: KdlDocument = src.parse()?;
    let lines = LineIndex::new(src);
    convert_nodes(&doc, &lines)
}

fn convert_nodes(doc: &KdlDocument, lines: &LineIndex) -> Result<Vec<Directive>, ConfigError> {
    doc.nodes()
        .iter()
        .map(|node| convert_node(node, lines))
        .collect()
}

fn convert_node(node: &KdlNode, lines: &LineIndex) -> Result<Directive, ConfigError> {
    let name = node.name().value().to_string();
    let line = lines.line_of(node.name().span().offset());

    let mut args = Vec::new();
    for entry in node.entries() {
        if let Some(key) = entry.name() {
            return Err(ConfigError::UnexpectedProperty {
                directive: name,
                key: key.value().to_string(),
                line,
            });
        }
        args.push(argument_text(entry.value()));
    }

    let block = node
        .children()
        .map(|children| convert_nodes(children, lines))
        .transpose()?;

    Ok(Directive {
        name,
        line,
        args,
        block,
    })
}

/// Arguments are read as text; numbers keep their written value.
fn argument_text(value: &KdlValue) -> String {
    match value {
        KdlValue::String(s) => s.clone(),
        KdlValue::Integer(n) => n.to_string(),
        KdlValue::Float(f) => f.to_string(),
        KdlValue::Bool(b) => b.to_string(),
        KdlValue::Null => "null".to_string(),
    }
}

/// Byte offsets of line starts, for turning spans into line numbers.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(src: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(src.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset)
    }
}

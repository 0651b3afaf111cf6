//! Rule conditions: a small boolean expression language over the `input`
//! and `data` documents.
//!
//! ```text
//! input.method == "GET" && input.path[0] == "public"
//! input.identity in data.acl["ops-team"]
//! !(input.n >= 10 || input.n < 0)
//! ```
//!
//! `!` binds tighter than `&&`, which binds tighter than `||`. Comparisons
//! do not chain. Numbers compare by value whatever their written form.

use std::borrow::Cow;
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::{Number, Value};

use crate::policy::errors::ConditionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Ref(Reference),
    Not(Box<Expr>),
    /// Holds when every term holds. Terms are checked left to right and
    /// checking stops at the first false one.
    All(Vec<Expr>),
    /// Holds when some term holds, stopping at the first true one.
    Any(Vec<Expr>),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Member {
        needle: Box<Expr>,
        haystack: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Input,
    Data,
}

/// A path into one of the bound documents, e.g. `data.acl["ops-team"][0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub root: Root,
    pub path: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

fn syntax(msg: impl Into<String>) -> ConditionError {
    ConditionError::Syntax(msg.into())
}

fn mismatch(msg: impl Into<String>) -> ConditionError {
    ConditionError::Evaluation(msg.into())
}

// Lexing

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(Number),
    Text(String),
    Punct(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "`{w}`"),
            Token::Number(n) => write!(f, "`{n}`"),
            Token::Text(s) => write!(f, "string {s:?}"),
            Token::Punct(p) => write!(f, "`{p}`"),
        }
    }
}

fn describe(token: Option<&Token>) -> String {
    token.map_or_else(|| "end of expression".to_string(), Token::to_string)
}

/// Produces tokens on demand; the parser never holds more than one.
struct Lexer<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, ConditionError> {
        self.eat_while(char::is_whitespace);
        let Some((start, c)) = self.chars.next() else {
            return Ok(None);
        };
        let token = match c {
            '"' => Token::Text(self.text()?),
            '0'..='9' => Token::Number(self.number(start)?),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = self.eat_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                Token::Word(self.src[start..end].to_string())
            }
            c => Token::Punct(self.punct(c)?),
        };
        Ok(Some(token))
    }

    /// Consume while `pred` holds and return the byte offset reached.
    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> usize {
        while self.chars.next_if(|&(_, c)| pred(c)).is_some() {}
        self.chars.peek().map_or(self.src.len(), |&(i, _)| i)
    }

    fn text(&mut self) -> Result<String, ConditionError> {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '"' => return Ok(out),
                '\\' => match self.chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(syntax("unterminated string literal"))
    }

    fn number(&mut self, start: usize) -> Result<Number, ConditionError> {
        let mut end = self.eat_while(|c| c.is_ascii_digit());
        let fractional = self.chars.next_if(|&(_, c)| c == '.').is_some();
        if fractional {
            end = self.eat_while(|c| c.is_ascii_digit());
        }
        let text = &self.src[start..end];
        let number = if fractional {
            text.parse::<f64>().ok().and_then(Number::from_f64)
        } else {
            text.parse::<i64>().ok().map(Number::from)
        };
        number.ok_or_else(|| syntax(format!("invalid number `{text}`")))
    }

    fn punct(&mut self, first: char) -> Result<&'static str, ConditionError> {
        let second = self.chars.peek().map(|&(_, c)| c);
        let pair = match (first, second) {
            ('=', Some('=')) => Some("=="),
            ('!', Some('=')) => Some("!="),
            ('<', Some('=')) => Some("<="),
            ('>', Some('=')) => Some(">="),
            ('&', Some('&')) => Some("&&"),
            ('|', Some('|')) => Some("||"),
            _ => None,
        };
        if let Some(pair) = pair {
            self.chars.next();
            return Ok(pair);
        }
        match first {
            '!' => Ok("!"),
            '<' => Ok("<"),
            '>' => Ok(">"),
            '.' => Ok("."),
            '(' => Ok("("),
            ')' => Ok(")"),
            '[' => Ok("["),
            ']' => Ok("]"),
            c => Err(syntax(format!("unexpected character `{c}`"))),
        }
    }
}

// Parsing

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self, ConditionError> {
        let mut lexer = Lexer::new(src);
        let lookahead = lexer.next_token()?;
        Ok(Self { lexer, lookahead })
    }

    fn bump(&mut self) -> Result<Option<Token>, ConditionError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn eat(&mut self, punct: &str) -> Result<bool, ConditionError> {
        let at = matches!(&self.lookahead, Some(Token::Punct(p)) if *p == punct);
        if at {
            self.bump()?;
        }
        Ok(at)
    }

    fn expect(&mut self, punct: &str) -> Result<(), ConditionError> {
        if self.eat(punct)? {
            return Ok(());
        }
        Err(syntax(format!(
            "expected `{punct}`, found {}",
            describe(self.lookahead.as_ref())
        )))
    }

    /// disjunction = conjunction ("||" conjunction)*
    fn disjunction(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.conjunction()?];
        while self.eat("||")? {
            terms.push(self.conjunction()?);
        }
        Ok(flatten(terms, Expr::Any))
    }

    /// conjunction = comparison ("&&" comparison)*
    fn conjunction(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.comparison()?];
        while self.eat("&&")? {
            terms.push(self.comparison()?);
        }
        Ok(flatten(terms, Expr::All))
    }

    /// comparison = unary ((cmp-op | "in") unary)?
    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.unary()?;
        if matches!(&self.lookahead, Some(Token::Word(w)) if w == "in") {
            self.bump()?;
            return Ok(Expr::Member {
                needle: Box::new(lhs),
                haystack: Box::new(self.unary()?),
            });
        }
        let op = match &self.lookahead {
            Some(Token::Punct(p)) => CmpOp::from_symbol(p),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        self.bump()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(self.unary()?),
        })
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat("!")? {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.bump()? {
            Some(Token::Number(n)) => Ok(Expr::Const(Value::Number(n))),
            Some(Token::Text(s)) => Ok(Expr::Const(Value::String(s))),
            Some(Token::Word(word)) => match word.as_str() {
                "true" => Ok(Expr::Const(Value::Bool(true))),
                "false" => Ok(Expr::Const(Value::Bool(false))),
                "input" => self.reference(Root::Input),
                "data" => self.reference(Root::Data),
                other => Err(syntax(format!(
                    "unknown reference root `{other}` (expected `input` or `data`)"
                ))),
            },
            Some(Token::Punct("(")) => {
                let inner = self.disjunction()?;
                self.expect(")")?;
                Ok(inner)
            }
            other => Err(syntax(format!(
                "expected a value, found {}",
                describe(other.as_ref())
            ))),
        }
    }

    /// reference = root ("." word | "[" (integer | string) "]")*
    fn reference(&mut self, root: Root) -> Result<Expr, ConditionError> {
        let mut path = Vec::new();
        loop {
            if self.eat(".")? {
                match self.bump()? {
                    Some(Token::Word(key)) => path.push(Step::Key(key)),
                    other => {
                        return Err(syntax(format!(
                            "expected a field name after `.`, found {}",
                            describe(other.as_ref())
                        )))
                    }
                }
            } else if self.eat("[")? {
                let step = match self.bump()? {
                    Some(Token::Number(n)) => n
                        .as_u64()
                        .and_then(|i| usize::try_from(i).ok())
                        .map(Step::Index),
                    Some(Token::Text(key)) => Some(Step::Key(key)),
                    _ => None,
                };
                path.push(step.ok_or_else(|| {
                    syntax("expected a non-negative integer or string inside `[]`")
                })?);
                self.expect("]")?;
            } else {
                return Ok(Expr::Ref(Reference { root, path }));
            }
        }
    }
}

fn flatten(mut terms: Vec<Expr>, join: fn(Vec<Expr>) -> Expr) -> Expr {
    if terms.len() == 1 {
        return terms.remove(0);
    }
    join(terms)
}

/// Parse a condition expression.
pub fn parse_condition(src: &str) -> Result<Expr, ConditionError> {
    let mut parser = Parser::new(src)?;
    if parser.lookahead.is_none() {
        return Err(syntax("empty expression"));
    }
    let expr = parser.disjunction()?;
    match parser.lookahead {
        None => Ok(expr),
        Some(extra) => Err(syntax(format!("unexpected trailing {extra}"))),
    }
}

// Evaluation

/// The documents a condition can reference.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub input: &'a Value,
    pub data: &'a Value,
}

impl<'a> Bindings<'a> {
    /// Missing fields and out-of-range indices resolve to null.
    fn lookup(&self, reference: &Reference) -> &'a Value {
        let root = match reference.root {
            Root::Input => self.input,
            Root::Data => self.data,
        };
        reference
            .path
            .iter()
            .try_fold(root, |node, step| match step {
                Step::Key(key) => node.get(key.as_str()),
                Step::Index(i) => node.get(*i),
            })
            .unwrap_or(&Value::Null)
    }
}

/// Whether the condition holds. A condition whose value is not a boolean
/// is an error, never false.
pub fn evaluate(expr: &Expr, bindings: &Bindings<'_>) -> Result<bool, ConditionError> {
    holds(expr, bindings)
}

fn holds(expr: &Expr, env: &Bindings<'_>) -> Result<bool, ConditionError> {
    match expr {
        Expr::Not(inner) => Ok(!holds(inner, env)?),
        Expr::All(terms) => {
            for term in terms {
                if !holds(term, env)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Any(terms) => {
            for term in terms {
                if holds(term, env)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Compare { op, lhs, rhs } => compare(*op, &*operand(lhs, env)?, &*operand(rhs, env)?),
        Expr::Member { needle, haystack } => {
            let needle = operand(needle, env)?;
            match operand(haystack, env)?.as_ref() {
                Value::Array(items) => Ok(items.iter().any(|item| same(item, &needle))),
                Value::Null => Ok(false),
                other => Err(mismatch(format!(
                    "`in` needs an array on the right, found {}",
                    kind(other)
                ))),
            }
        }
        Expr::Const(_) | Expr::Ref(_) => match operand(expr, env)?.as_ref() {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(format!("expected a boolean, found {}", kind(other)))),
        },
    }
}

/// The value of an expression. Constants and references are borrowed.
fn operand<'a>(expr: &'a Expr, env: &Bindings<'a>) -> Result<Cow<'a, Value>, ConditionError> {
    match expr {
        Expr::Const(value) => Ok(Cow::Borrowed(value)),
        Expr::Ref(reference) => Ok(Cow::Borrowed(env.lookup(reference))),
        _ => holds(expr, env).map(|b| Cow::Owned(Value::Bool(b))),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, ConditionError> {
    if op == CmpOp::Eq {
        return Ok(same(lhs, rhs));
    }
    if op == CmpOp::Ne {
        return Ok(!same(lhs, rhs));
    }
    let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(mismatch(format!(
            "`{op}` needs numbers, found {} and {}",
            kind(lhs),
            kind(rhs)
        )));
    };
    Ok(match op {
        CmpOp::Lt => l < r,
        CmpOp::Le => l <= r,
        CmpOp::Gt => l > r,
        _ => l >= r,
    })
}

/// JSON equality, except numbers compare by value so that `4 == 4.0`.
fn same(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => l.as_f64() == r.as_f64(),
        },
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| same(a, b))
        }
        _ => lhs == rhs,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

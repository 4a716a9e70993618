//! Conditional resolver
//!
//! Conditions are small boolean expressions over top-level parameters:
//!
//! ```text
//! enable_addon
//! !use_spot && var.node_count > 0
//! substrate == "eks" || substrate == "ec2"
//! ```
//!
//! A resource whose condition is false is removed before graph construction,
//! so it contributes no node and cannot be referenced. Conditions never look
//! at other resources, so they are evaluated in parallel.

use crate::error::ConfigError;
use crate::resource::{Configuration, ResourceSpec};
use crate::value::Attributes;
use rayon::prelude::*;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        };
        f.write_str(symbol)
    }
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(Json),
    Param(String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare {
        op: CompareOp,
        lhs: Box<Condition>,
        rhs: Box<Condition>,
    },
}

/// Why a condition could not be evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    UndefinedParameter(String),
    TypeMismatch(String),
}

impl Condition {
    /// Parse a condition expression
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {token}")),
        }
    }

    /// Evaluate to a boolean against the given parameters
    pub fn evaluate(&self, params: &Attributes) -> Result<bool, EvalError> {
        Ok(truthy(&self.value(params)?))
    }

    /// Parameters this expression reads
    pub fn parameters(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_parameters(&mut names);
        names
    }

    fn collect_parameters<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Param(name) => {
                names.insert(name);
            }
            Self::Not(inner) => inner.collect_parameters(names),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_parameters(names);
                b.collect_parameters(names);
            }
            Self::Compare { lhs, rhs, .. } => {
                lhs.collect_parameters(names);
                rhs.collect_parameters(names);
            }
        }
    }

    fn value(&self, params: &Attributes) -> Result<Json, EvalError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Param(name) => params
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedParameter(name.clone())),
            Self::Not(inner) => Ok(Json::Bool(!inner.evaluate(params)?)),
            // Both sides are evaluated so an undefined parameter is never masked
            Self::And(a, b) => {
                let (a, b) = (a.evaluate(params)?, b.evaluate(params)?);
                Ok(Json::Bool(a && b))
            }
            Self::Or(a, b) => {
                let (a, b) = (a.evaluate(params)?, b.evaluate(params)?);
                Ok(Json::Bool(a || b))
            }
            Self::Compare { op, lhs, rhs } => {
                Ok(Json::Bool(compare(*op, &lhs.value(params)?, &rhs.value(params)?)?))
            }
        }
    }
}

/// Booleans as-is, numbers non-zero, strings and collections non-empty
fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(items) => !items.is_empty(),
        Json::Object(map) => !map.is_empty(),
    }
}

fn compare(op: CompareOp, lhs: &Json, rhs: &Json) -> Result<bool, EvalError> {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return Ok(match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
        });
    }
    match op {
        CompareOp::Eq => Ok(lhs == rhs),
        CompareOp::Ne => Ok(lhs != rhs),
        _ => Err(EvalError::TypeMismatch(format!(
            "cannot order {lhs} {op} {rhs}: both sides must be numbers"
        ))),
    }
}

// ============================================================================
// Tokenizer and parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Bang,
    AndAnd,
    OrOr,
    Op(CompareOp),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "identifier {name}"),
            Self::Number(n) => write!(f, "number {n}"),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::Bang => f.write_str("'!'"),
            Self::AndAnd => f.write_str("'&&'"),
            Self::OrOr => f.write_str("'||'"),
            Self::Op(op) => write!(f, "'{op}'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '"')
                    .map(|p| start + p)
                    .ok_or("unterminated string")?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number {text}"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => {
                        let name = word.strip_prefix("var.").unwrap_or(&word);
                        if name.is_empty() || name.contains('.') {
                            return Err(format!("invalid parameter name {word}"));
                        }
                        Token::Ident(name.to_string())
                    }
                });
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Condition, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Condition, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Condition, String> {
        let lhs = self.atom()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.atom()?;
            return Ok(Condition::Compare {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<Condition, String> {
        match self.advance() {
            Some(Token::True) => Ok(Condition::Literal(Json::Bool(true))),
            Some(Token::False) => Ok(Condition::Literal(Json::Bool(false))),
            Some(Token::Number(n)) => serde_json::Number::from_f64(n)
                .map(|n| Condition::Literal(Json::Number(n)))
                .ok_or_else(|| format!("invalid number {n}")),
            Some(Token::Str(s)) => Ok(Condition::Literal(Json::String(s))),
            Some(Token::Ident(name)) => Ok(Condition::Param(name)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(format!("expected ')', found {other}")),
                    None => Err("expected ')', found end of expression".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected {other}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Configuration after conditions and parameter substitutions are applied
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    /// Surviving resources by name, inputs with parameters substituted
    pub resources: BTreeMap<String, ResourceSpec>,
    /// Names pruned because their condition evaluated false
    pub absent: BTreeSet<String>,
    /// Top-level parameters used for resolution
    pub parameters: Attributes,
}

impl ResolvedConfig {
    /// Whether a name survived resolution
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }
}

/// Evaluate conditions and substitute parameters.
///
/// Fails fast with the first error in declaration order.
pub fn resolve(config: &Configuration) -> Result<ResolvedConfig, ConfigError> {
    let mut seen = BTreeSet::new();
    for spec in &config.resources {
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                name: spec.name.clone(),
            });
        }
    }

    let evaluated: Vec<Result<Option<ResourceSpec>, ConfigError>> = config
        .resources
        .par_iter()
        .map(|spec| resolve_one(spec, &config.parameters))
        .collect();

    let mut resolved = ResolvedConfig {
        parameters: config.parameters.clone(),
        ..ResolvedConfig::default()
    };
    for (spec, result) in config.resources.iter().zip(evaluated) {
        match result? {
            Some(spec) => {
                resolved.resources.insert(spec.name.clone(), spec);
            }
            None => {
                log::debug!("Pruned {} (condition is false)", spec.name);
                resolved.absent.insert(spec.name.clone());
            }
        }
    }

    Ok(resolved)
}

fn resolve_one(spec: &ResourceSpec, params: &Attributes) -> Result<Option<ResourceSpec>, ConfigError> {
    if let Some(source) = &spec.condition {
        let condition = Condition::parse(source).map_err(|message| ConfigError::MalformedCondition {
            resource: spec.name.clone(),
            message,
        })?;
        let present = condition.evaluate(params).map_err(|e| match e {
            EvalError::UndefinedParameter(parameter) => ConfigError::UndefinedParameter {
                resource: spec.name.clone(),
                parameter,
            },
            EvalError::TypeMismatch(message) => ConfigError::MalformedCondition {
                resource: spec.name.clone(),
                message,
            },
        })?;
        if !present {
            return Ok(None);
        }
    }

    let mut resolved = spec.clone();
    for (attribute, value) in &mut resolved.inputs {
        *value = value
            .substitute_parameters(params)
            .map_err(|parameter| ConfigError::UndefinedParameter {
                resource: spec.name.clone(),
                parameter,
            })?;
        if let Some(raw) = value.embedded_reference() {
            return Err(ConfigError::InvalidReference {
                resource: spec.name.clone(),
                attribute: attribute.clone(),
                message: format!("{raw:?} must be exactly one ${{resource.<name>.<attr>}} reference"),
            });
        }
    }

    Ok(Some(resolved))
}

//! Closed expression grammar used by step configs.
//!
//! Templates replace `${path}` placeholders with values from the execution
//! context. Conditions support field paths, literals, the comparison
//! operators `== != > >= < <=`, `&&`, `||`, `!` and parentheses. Nothing
//! else is evaluated.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::OnceLock;

use crate::error::{OrchestratorError, Result};

static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();

fn placeholder() -> Result<&'static Regex> {
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{\s*([A-Za-z0-9_.]+)\s*\}").ok())
        .as_ref()
        .ok_or_else(|| OrchestratorError::expression("placeholder pattern failed to compile"))
}

/// Follow a dotted path through objects (by key) and arrays (by index).
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Substitute every `${path}` in `template`. Unresolved placeholders are an error.
pub fn render(template: &str, context: &Map<String, Value>) -> Result<String> {
    let re = placeholder()?;
    let mut missing = None;
    let rendered = re.replace_all(template, |caps: &Captures| {
        let path = &caps[1];
        match lookup(context, path) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.get_or_insert_with(|| path.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(path) => Err(OrchestratorError::expression(format!(
            "unresolved placeholder ${{{}}}",
            path
        ))),
        None => Ok(rendered.into_owned()),
    }
}

/// Render every string inside `value`. A string that is exactly one
/// placeholder is replaced by the referenced value itself, keeping its type.
pub fn render_value(value: &Value, context: &Map<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => {
            let re = placeholder()?;
            if let Some(caps) = re.captures(s) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
                    return lookup(context, &caps[1]).cloned().ok_or_else(|| {
                        OrchestratorError::expression(format!(
                            "unresolved placeholder ${{{}}}",
                            &caps[1]
                        ))
                    });
                }
            }
            render(s, context).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| render_value(v, context).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Parse and evaluate a condition in one go.
pub fn evaluate(condition: &str, context: &Map<String, Value>) -> Result<bool> {
    Condition::parse(condition)?.evaluate(context)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(String),
    Literal(Value),
}

impl Operand {
    fn resolve(&self, context: &Map<String, Value>) -> Value {
        match self {
            Self::Path(path) => lookup(context, path).cloned().unwrap_or(Value::Null),
            Self::Literal(value) => value.clone(),
        }
    }
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(OrchestratorError::expression("empty condition"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(OrchestratorError::expression(format!(
                "unexpected {:?} in `{}`",
                parser.tokens[parser.pos], input
            )));
        }
        Ok(condition)
    }

    pub fn evaluate(&self, context: &Map<String, Value>) -> Result<bool> {
        match self {
            Self::Or(a, b) => Ok(a.evaluate(context)? || b.evaluate(context)?),
            Self::And(a, b) => Ok(a.evaluate(context)? && b.evaluate(context)?),
            Self::Not(inner) => Ok(!inner.evaluate(context)?),
            Self::Truthy(operand) => Ok(is_truthy(&operand.resolve(context))),
            Self::Compare(left, op, right) => {
                compare(&left.resolve(context), *op, &right.resolve(context))
            }
        }
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    let ordered = |check: fn(Ordering) -> bool| {
        ordering.map(check).ok_or_else(|| {
            OrchestratorError::expression(format!("cannot order {} and {}", left, right))
        })
    };

    match op {
        CmpOp::Eq => Ok(ordering.map_or(left == right, |o| o == Ordering::Equal)),
        CmpOp::Ne => Ok(ordering.map_or(left != right, |o| o != Ordering::Equal)),
        CmpOp::Gt => ordered(|o| o == Ordering::Greater),
        CmpOp::Ge => ordered(|o| o != Ordering::Less),
        CmpOp::Lt => ordered(|o| o == Ordering::Less),
        CmpOp::Le => ordered(|o| o != Ordering::Greater),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(Value),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let two = |i: usize, s: &str| -> bool {
        let mut expected = s.chars();
        chars.get(i) == expected.next().as_ref() && chars.get(i + 1) == expected.next().as_ref()
    };

    while i < chars.len() {
        let c = chars[i];
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
            _ if two(i, "&&") => {
                tokens.push(Token::And);
                i += 2;
            }
            _ if two(i, "||") => {
                tokens.push(Token::Or);
                i += 2;
            }
            _ if two(i, "==") => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            _ if two(i, "!=") => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            _ if two(i, ">=") => {
                tokens.push(Token::Cmp(CmpOp::Ge));
                i += 2;
            }
            _ if two(i, "<=") => {
                tokens.push(Token::Cmp(CmpOp::Le));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            '<' => {
                tokens.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(OrchestratorError::expression(format!(
                                "unterminated string in `{}`",
                                input
                            )))
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let end = (start..chars.len())
                    .find(|j| chars[*j] == '}')
                    .ok_or_else(|| {
                        OrchestratorError::expression(format!("unterminated placeholder in `{}`", input))
                    })?;
                let path: String = chars[start..end].iter().collect();
                tokens.push(Token::Path(path.trim().to_string()));
                i = end + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: f64 = text.parse().map_err(|_| {
                    OrchestratorError::expression(format!("invalid number {}", text))
                })?;
                let value = serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .ok_or_else(|| OrchestratorError::expression(format!("invalid number {}", text)))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Path(word),
                });
            }
            other => {
                return Err(OrchestratorError::expression(format!(
                    "unexpected character '{}' in `{}`",
                    other, input
                )))
            }
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Condition> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Condition::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Condition> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Condition::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Condition> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Condition::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(OrchestratorError::expression("missing closing parenthesis")),
                }
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Condition> {
        let left = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Condition::Compare(left, op, right));
        }
        Ok(Condition::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Path(path)) => Ok(Operand::Path(path)),
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(other) => Err(OrchestratorError::expression(format!(
                "expected a value, found {:?}",
                other
            ))),
            None => Err(OrchestratorError::expression("unexpected end of condition")),
        }
    }
}

//! Edge condition expressions and parameter interpolation.
//!
//! ```text
//! expr     := or
//! or       := and (("||" | "or") and)*
//! and      := unary (("&&" | "and") unary)*
//! unary    := ("!" | "not") unary | compare
//! compare  := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary  := literal | path | "(" expr ")"
//! ```
//!
//! Paths are dot separated (`triage.severity`, `items.0.id`) and resolve
//! against the execution variables; a missing path is `null`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("cannot evaluate '{expression}': {message}")]
    Evaluation { expression: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
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

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// A parsed condition, evaluated against the execution variables
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            position: 0,
        };
        let expr = parser.parse_or()?;

        if let Some((offset, token)) = parser.peek_with_offset() {
            return Err(ConditionError::Parse {
                position: offset,
                message: format!("unexpected token {}", token),
            });
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, variables: &HashMap<String, Value>) -> Result<bool, ConditionError> {
        let value = self.eval(&self.expr, variables)?;
        Ok(is_truthy(&value))
    }

    fn eval(&self, expr: &Expr, variables: &HashMap<String, Value>) -> Result<Value, ConditionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(segments) => Ok(resolve_segments(variables, segments)),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner, variables)?))),
            Expr::And(left, right) => {
                if !is_truthy(&self.eval(left, variables)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&self.eval(right, variables)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&self.eval(left, variables)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&self.eval(right, variables)?)))
            }
            Expr::Compare(left, op, right) => {
                let left = self.eval(left, variables)?;
                let right = self.eval(right, variables)?;
                self.compare(&left, *op, &right).map(Value::Bool)
            }
        }
    }

    fn compare(&self, left: &Value, op: CompareOp, right: &Value) -> Result<bool, ConditionError> {
        match op {
            CompareOp::Eq => Ok(values_equal(left, right)),
            CompareOp::Ne => Ok(!values_equal(left, right)),
            _ => {
                let ordering = match (left, right) {
                    (Value::Number(a), Value::Number(b)) => {
                        let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                        a.partial_cmp(&b)
                    }
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                };

                let ordering = ordering.ok_or_else(|| ConditionError::Evaluation {
                    expression: self.source.clone(),
                    message: format!(
                        "cannot compare {} {} {}",
                        type_name(left),
                        op.symbol(),
                        type_name(right)
                    ),
                })?;

                Ok(match op {
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    CompareOp::Eq => ordering.is_eq(),
                    CompareOp::Ne => ordering.is_ne(),
                })
            }
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// `null`, `false`, `0`, `""` and empty collections are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Resolve a dot path against the variables; missing segments yield `null`
pub fn resolve_path(variables: &HashMap<String, Value>, path: &str) -> Value {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    resolve_segments(variables, &segments)
}

fn resolve_segments(variables: &HashMap<String, Value>, segments: &[String]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return Value::Null;
    };

    let mut current = match variables.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };

    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }

    current.clone()
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}").expect("valid placeholder regex")
});

/// Replace `${path}` placeholders in string values.
///
/// A string that is exactly one placeholder takes the variable's value
/// with its JSON type; placeholders embedded in longer strings are replaced
/// by their textual form.
pub fn interpolate(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(text) => interpolate_str(text, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn interpolate_str(text: &str, variables: &HashMap<String, Value>) -> Value {
    if let Some(captures) = PLACEHOLDER.captures(text) {
        if let Some(whole) = captures.get(0) {
            if whole.start() == 0 && whole.end() == text.len() {
                return resolve_path(variables, &captures[1]);
            }
        }
    } else {
        return Value::String(text.to_string());
    }

    let replaced = PLACEHOLDER.replace_all(text, |captures: &regex::Captures<'_>| {
        match resolve_path(variables, &captures[1]) {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "'{}'", name),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Op(op) => write!(f, "'{}'", op.symbol()),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::Not => write!(f, "'!'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
        }
    }
}

fn parse_error(position: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Op(CompareOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Op(CompareOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Not));
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    (_, true) => CompareOp::Ge,
                    (_, false) => CompareOp::Gt,
                };
                tokens.push((offset, Token::Op(op)));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, c)) = chars.get(i) else {
                        return Err(parse_error(offset, "unterminated string"));
                    };
                    i += 1;
                    match c {
                        '\\' => {
                            if let Some(&(_, escaped)) = chars.get(i) {
                                text.push(escaped);
                                i += 1;
                            }
                        }
                        c if c == quote => break,
                        c => text.push(c),
                    }
                }
                tokens.push((offset, Token::Str(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| parse_error(offset, format!("invalid number '{}'", literal)))?;
                tokens.push((offset, Token::Number(number)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push((offset, token));
            }
            other => {
                return Err(parse_error(offset, format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn peek_with_offset(&self) -> Option<(usize, &Token)> {
        self.tokens
            .get(self.position)
            .map(|(offset, token)| (*offset, token))
    }

    fn end_offset(&self) -> usize {
        self.tokens
            .last()
            .map(|(offset, _)| offset + 1)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(_, token)| token.clone());
        self.position += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let offset = self
            .peek_with_offset()
            .map(|(offset, _)| offset)
            .unwrap_or_else(|| self.end_offset());

        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Path(word.split('.').map(str::to_string).collect()),
            }),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(parse_error(offset, "unclosed parenthesis")),
                }
            }
            Some(token) => Err(parse_error(offset, format!("unexpected token {}", token))),
            None => Err(parse_error(offset, "unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("triage".to_string(), json!({"severity": 8, "category": "malware"}));
        vars.insert("items".to_string(), json!([{"id": "a"}, {"id": "b"}]));
        vars.insert("approved".to_string(), json!(true));
        vars.insert("empty".to_string(), json!(""));
        vars
    }

    fn eval(expression: &str) -> bool {
        Condition::parse(expression).unwrap().evaluate(&vars()).unwrap()
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("triage.severity >= 7"));
        assert!(eval("triage.severity == 8"));
        assert!(eval("triage.severity != 3"));
        assert!(!eval("triage.severity < 8"));
        assert!(eval("triage.category == 'malware'"));
        assert!(eval("items.1.id == \"b\""));
        assert!(eval("-1 < 0"));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        assert!(eval("approved && triage.severity > 5"));
        assert!(eval("approved and not (triage.severity > 9)"));
        assert!(eval("false || approved"));
        assert!(eval("false or true and approved"));
        assert!(!eval("!approved"));
    }

    #[test]
    fn test_missing_paths_and_truthiness() {
        assert!(!eval("missing"));
        assert!(eval("missing == null"));
        assert!(!eval("empty"));
        assert!(eval("items"));
        assert!(!eval("triage.missing.deeper"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Condition::parse("severity >"), Err(ConditionError::Parse { .. })));
        assert!(matches!(Condition::parse("(a == 1"), Err(ConditionError::Parse { .. })));
        assert!(matches!(Condition::parse("a == 'open"), Err(ConditionError::Parse { .. })));
        assert!(matches!(Condition::parse("a # b"), Err(ConditionError::Parse { .. })));
        assert!(matches!(Condition::parse("a b"), Err(ConditionError::Parse { .. })));
    }

    #[test]
    fn test_incomparable_types_fail_evaluation() {
        let condition = Condition::parse("triage.category > 3").unwrap();
        assert!(matches!(
            condition.evaluate(&vars()),
            Err(ConditionError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_interpolation() {
        let params = json!({
            "severity": "${triage.severity}",
            "first": "${items.0}",
            "label": "case ${triage.category}/${triage.severity}",
            "missing": "${nope}",
            "literal": "no placeholders",
            "nested": ["${approved}"]
        });

        let resolved = interpolate(&params, &vars());
        assert_eq!(resolved["severity"], json!(8));
        assert_eq!(resolved["first"], json!({"id": "a"}));
        assert_eq!(resolved["label"], json!("case malware/8"));
        assert_eq!(resolved["missing"], Value::Null);
        assert_eq!(resolved["literal"], json!("no placeholders"));
        assert_eq!(resolved["nested"][0], json!(true));
    }
}

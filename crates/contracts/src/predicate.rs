//! Stream query predicates
//!
//! A small boolean language over descriptor properties:
//!
//! ```text
//! name='EEG' and (type='Markers' or not(channel_count>1))
//! starts-with(name,'Kart') and nominal_srate>=128
//! ```
//!
//! Values are compared numerically when both sides parse as numbers,
//! lexically otherwise. An empty predicate matches every stream.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Result, StreamError};

/// Properties a predicate may reference
pub const QUERYABLE_PROPERTIES: &[&str] = &[
    "name",
    "type",
    "channel_count",
    "nominal_srate",
    "channel_format",
    "source_id",
    "hostname",
    "uid",
    "session_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        property: String,
        op: CompareOp,
        literal: String,
    },
    StartsWith {
        property: String,
        prefix: String,
    },
    Contains {
        property: String,
        needle: String,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<String>) -> bool {
        match self {
            Expr::Compare {
                property,
                op,
                literal,
            } => match lookup(property) {
                Some(actual) => op.holds(compare_values(&actual, literal)),
                None => false,
            },
            Expr::StartsWith { property, prefix } => {
                lookup(property).is_some_and(|v| v.starts_with(prefix.as_str()))
            }
            Expr::Contains { property, needle } => {
                lookup(property).is_some_and(|v| v.contains(needle.as_str()))
            }
            Expr::Not(inner) => !inner.evaluate(lookup),
            Expr::And(a, b) => a.evaluate(lookup) && b.evaluate(lookup),
            Expr::Or(a, b) => a.evaluate(lookup) || b.evaluate(lookup),
        }
    }
}

fn compare_values(actual: &str, literal: &str) -> Ordering {
    match (actual.parse::<f64>(), literal.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(literal),
    }
}

/// A parsed, validated stream query
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Option<Expr>,
}

impl Predicate {
    /// Predicate matching every stream
    pub fn any() -> Self {
        Self {
            source: String::new(),
            expr: None,
        }
    }

    /// `prop='value'`
    pub fn equals(property: &str, value: &str) -> Result<Self> {
        Self::parse(&format!("{property}='{}'", value.replace('\'', "\\'")))
    }

    /// Parse predicate text.
    ///
    /// # Errors
    /// `Argument` on malformed syntax or unknown property names.
    pub fn parse(text: &str) -> Result<Self> {
        let source = text.trim().to_string();
        if source.is_empty() {
            return Ok(Self::any());
        }
        let tokens = tokenize(&source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(syntax_error(&format!("unexpected {token}")));
        }
        Ok(Self {
            source,
            expr: Some(expr),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> Option<&Expr> {
        self.expr.as_ref()
    }

    /// Evaluate against a property lookup
    pub fn evaluate(&self, lookup: impl Fn(&str) -> Option<String>) -> bool {
        match &self.expr {
            Some(expr) => expr.evaluate(&lookup),
            None => true,
        }
    }

    /// AND-combine two predicates
    pub fn and(&self, other: &Predicate) -> Predicate {
        match (&self.expr, &other.expr) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(a), Some(b)) => Predicate {
                source: format!("({}) and ({})", self.source, other.source),
                expr: Some(Expr::And(Box::new(a.clone()), Box::new(b.clone()))),
            },
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Predicate {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Predicate::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn syntax_error(detail: &str) -> StreamError {
    StreamError::argument(format!("malformed predicate: {detail}"))
}

// ========== Lexer ==========

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{s}'"),
            Token::Literal(s) => write!(f, "literal '{s}'"),
            Token::Op(op) => write!(f, "operator {op:?}"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' | '<' | '>' => {
                let has_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, has_eq) {
                    ('!', true) => CompareOp::Ne,
                    ('<', true) => CompareOp::Le,
                    ('>', true) => CompareOp::Ge,
                    ('<', false) => CompareOp::Lt,
                    ('>', false) => CompareOp::Gt,
                    _ => return Err(syntax_error("'!' must be followed by '='")),
                };
                tokens.push(Token::Op(op));
                i += if has_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax_error("unterminated string literal")),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            literal.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            literal.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(literal));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '-' | '+'))
                {
                    i += 1;
                }
                let number: String = chars[start..i].iter().collect();
                if number.parse::<f64>().is_err() {
                    return Err(syntax_error(&format!("invalid number '{number}'")));
                }
                tokens.push(Token::Literal(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(syntax_error(&format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

// ========== Parser ==========

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

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax_error(&format!("expected {expected}, found {token}"))),
            None => Err(syntax_error(&format!("expected {expected}, found end of input"))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == keyword)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if name == "starts-with" || name == "contains" => {
                self.expect(Token::LParen)?;
                let property = self.parse_property()?;
                self.expect(Token::Comma)?;
                let literal = self.parse_literal()?;
                self.expect(Token::RParen)?;
                Ok(if name == "starts-with" {
                    Expr::StartsWith {
                        property,
                        prefix: literal,
                    }
                } else {
                    Expr::Contains {
                        property,
                        needle: literal,
                    }
                })
            }
            Some(Token::Ident(name)) => {
                let property = check_property(name)?;
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    Some(token) => {
                        return Err(syntax_error(&format!("expected operator, found {token}")))
                    }
                    None => return Err(syntax_error("expected operator, found end of input")),
                };
                let literal = self.parse_literal()?;
                Ok(Expr::Compare {
                    property,
                    op,
                    literal,
                })
            }
            Some(token) => Err(syntax_error(&format!("unexpected {token}"))),
            None => Err(syntax_error("unexpected end of input")),
        }
    }

    fn parse_property(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => check_property(name),
            Some(token) => Err(syntax_error(&format!("expected property, found {token}"))),
            None => Err(syntax_error("expected property, found end of input")),
        }
    }

    fn parse_literal(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(value),
            Some(token) => Err(syntax_error(&format!("expected literal, found {token}"))),
            None => Err(syntax_error("expected literal, found end of input")),
        }
    }
}

fn check_property(name: String) -> Result<String> {
    if QUERYABLE_PROPERTIES.contains(&name.as_str()) {
        Ok(name)
    } else {
        Err(syntax_error(&format!("unknown property '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval(predicate: &str, pairs: &[(&str, &str)]) -> bool {
        let map = props(pairs);
        Predicate::parse(predicate)
            .unwrap()
            .evaluate(|key| map.get(key).cloned())
    }

    #[test]
    fn test_equality_and_boolean_ops() {
        let eeg = [("name", "EEG"), ("type", "Signal"), ("channel_count", "8")];
        assert!(eval("name='EEG'", &eeg));
        assert!(eval("name='EEG' and type=\"Signal\"", &eeg));
        assert!(!eval("name='EEG' and type='Markers'", &eeg));
        assert!(eval("type='Markers' or name='EEG'", &eeg));
        assert!(eval("not(type='Markers')", &eeg));
        assert!(eval("name!='X' and (channel_count>4 or type='Y')", &eeg));
    }

    #[test]
    fn test_numeric_comparison_is_not_lexical() {
        let stream = [("nominal_srate", "128")];
        assert!(eval("nominal_srate>=100", &stream));
        assert!(eval("nominal_srate<1000", &stream));
        assert!(!eval("nominal_srate=128.5", &stream));
    }

    #[test]
    fn test_string_functions() {
        let stream = [("name", "KartMarkers"), ("source_id", "game-01")];
        assert!(eval("starts-with(name,'Kart')", &stream));
        assert!(eval("contains(source_id, '-0')", &stream));
        assert!(!eval("contains(name,'EEG')", &stream));
    }

    #[test]
    fn test_empty_matches_all() {
        assert!(eval("", &[]));
        assert!(eval("   ", &[("name", "x")]));
    }

    #[test]
    fn test_malformed_is_argument_error() {
        for bad in [
            "name=",
            "name='EEG",
            "(name='EEG'",
            "colour='red'",
            "name='a' and",
            "name ~ 'a'",
            "starts-with(name)",
        ] {
            let err = Predicate::parse(bad).unwrap_err();
            assert!(matches!(err, StreamError::Argument { .. }), "{bad}");
        }
    }

    #[test]
    fn test_equals_escapes_quotes() {
        let p = Predicate::equals("name", "it's").unwrap();
        let map = props(&[("name", "it's")]);
        assert!(p.evaluate(|k| map.get(k).cloned()));
    }

    #[test]
    fn test_serde_as_text() {
        let p: Predicate = serde_json::from_str("\"type='Markers'\"").unwrap();
        assert_eq!(p.as_str(), "type='Markers'");
        assert!(serde_json::from_str::<Predicate>("\"type=\"").is_err());
    }
}

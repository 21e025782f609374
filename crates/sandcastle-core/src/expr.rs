// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! A tiny safe-expression evaluator for policy conditions.
//!
//! Supports literals, identifiers, dotted attribute access, comparisons,
//! `in`, `and`/`or`/`not`, and a single builtin `len()`. No assignment, no
//! function calls other than `len`, no attribute access beyond plain dotted
//! paths. Never executes arbitrary code.

use crate::value::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Dot,
    Comma,
    LParen,
    RParen,
    True,
    False,
    Null,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExprError("unterminated string literal".to_string()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ExprError(format!("invalid number literal '{}'", text)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Value(Value),
}

impl EvalValue {
    fn truthy(&self) -> bool {
        match self {
            EvalValue::Null => false,
            EvalValue::Bool(b) => *b,
            EvalValue::Number(n) => *n != 0.0,
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::Value(v) => !matches!(v, Value::Null),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            EvalValue::Number(n) => Some(*n),
            EvalValue::Value(Value::Number(n)) => Some(*n),
            _ => None,
        }
    }

    fn as_str_repr(&self) -> String {
        match self {
            EvalValue::Null => String::new(),
            EvalValue::Bool(b) => b.to_string(),
            EvalValue::Number(n) => n.to_string(),
            EvalValue::Str(s) => s.clone(),
            EvalValue::Value(v) => v.render(),
        }
    }

    fn len(&self) -> Result<f64, ExprError> {
        match self {
            EvalValue::Str(s) => Ok(s.chars().count() as f64),
            EvalValue::Value(Value::Scalar(s)) => Ok(s.chars().count() as f64),
            EvalValue::Value(Value::List(l)) => Ok(l.len() as f64),
            EvalValue::Value(Value::Json(serde_json::Value::Array(a))) => Ok(a.len() as f64),
            EvalValue::Value(Value::Json(serde_json::Value::String(s))) => {
                Ok(s.chars().count() as f64)
            }
            EvalValue::Value(Value::Json(serde_json::Value::Object(o))) => Ok(o.len() as f64),
            other => Err(ExprError(format!("len() not supported for {:?}", other))),
        }
    }

    fn contains(&self, needle: &EvalValue) -> bool {
        match self {
            EvalValue::Str(s) => s.contains(&needle.as_str_repr()),
            EvalValue::Value(Value::List(items)) => {
                items.iter().any(|item| EvalValue::Value(item.clone()) == *needle)
            }
            EvalValue::Value(Value::Json(serde_json::Value::Array(items))) => {
                let target = needle.as_str_repr();
                items.iter().any(|item| item.to_string().trim_matches('"') == target)
            }
            EvalValue::Value(Value::Scalar(s)) => s.contains(&needle.as_str_repr()),
            _ => false,
        }
    }
}

impl PartialEq for EvalValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EvalValue::Null, EvalValue::Null) => true,
            (EvalValue::Bool(a), EvalValue::Bool(b)) => a == b,
            (EvalValue::Number(a), EvalValue::Number(b)) => a == b,
            (EvalValue::Str(a), EvalValue::Str(b)) => a == b,
            (EvalValue::Value(a), EvalValue::Value(b)) => a == b,
            _ => self.as_str_repr() == other.as_str_repr(),
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a HashMap<String, Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn expect(&mut self, t: &Token) -> Result<(), ExprError> {
        if self.peek() == Some(t) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError(format!("expected {:?}, found {:?}", t, self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<EvalValue, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = EvalValue::Bool(left.truthy() || right.truthy());
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<EvalValue, ExprError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = EvalValue::Bool(left.truthy() && right.truthy());
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<EvalValue, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let v = self.parse_not()?;
            return Ok(EvalValue::Bool(!v.truthy()));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<EvalValue, ExprError> {
        let left = self.parse_primary_chain()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Le) => Some(Token::Le),
            Some(Token::Gt) => Some(Token::Gt),
            Some(Token::Ge) => Some(Token::Ge),
            Some(Token::In) => Some(Token::In),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        self.advance();
        let right = self.parse_primary_chain()?;
        let result = match op {
            Token::Eq => left == right,
            Token::Ne => left != right,
            Token::In => right.contains(&left),
            Token::Lt | Token::Le | Token::Gt | Token::Ge => {
                let (a, b) = match (left.as_f64(), right.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        let (a, b) = (left.as_str_repr(), right.as_str_repr());
                        return Ok(EvalValue::Bool(match op {
                            Token::Lt => a < b,
                            Token::Le => a <= b,
                            Token::Gt => a > b,
                            Token::Ge => a >= b,
                            _ => unreachable!(),
                        }));
                    }
                };
                match op {
                    Token::Lt => a < b,
                    Token::Le => a <= b,
                    Token::Gt => a > b,
                    Token::Ge => a >= b,
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        };
        Ok(EvalValue::Bool(result))
    }

    fn parse_primary_chain(&mut self) -> Result<EvalValue, ExprError> {
        let mut value = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            let field = match self.advance() {
                Some(Token::Ident(name)) => name.clone(),
                other => return Err(ExprError(format!("expected field name after '.', found {:?}", other))),
            };
            value = match value {
                EvalValue::Value(v) => v.get_path(&field).map(EvalValue::Value).unwrap_or(EvalValue::Null),
                _ => EvalValue::Null,
            };
        }
        Ok(value)
    }

    fn parse_primary(&mut self) -> Result<EvalValue, ExprError> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(EvalValue::Number(n)),
            Some(Token::Str(s)) => Ok(EvalValue::Str(s)),
            Some(Token::True) => Ok(EvalValue::Bool(true)),
            Some(Token::False) => Ok(EvalValue::Bool(false)),
            Some(Token::Null) => Ok(EvalValue::Null),
            Some(Token::LParen) => {
                let v = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) if name == "len" && self.peek() == Some(&Token::LParen) => {
                self.advance();
                let arg = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(EvalValue::Number(arg.len()?))
            }
            Some(Token::Ident(name)) => self
                .vars
                .get(&name)
                .cloned()
                .map(EvalValue::Value)
                .ok_or_else(|| ExprError(format!("unknown identifier '{}'", name))),
            other => Err(ExprError(format!("unexpected token {:?}", other))),
        }
    }
}

/// Evaluates `expression` against `vars`, returning its truthiness per the
/// boolean-coercion rules above.
pub fn eval_condition(expression: &str, vars: &HashMap<String, Value>) -> Result<bool, ExprError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens: &tokens, pos: 0, vars };
    let result = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError("trailing tokens in expression".to_string()));
    }
    Ok(result.truthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn numeric_comparison() {
        let vars = vars(&[("step_cost_usd", Value::Number(1.5))]);
        assert!(eval_condition("step_cost_usd > 1.0", &vars).unwrap());
        assert!(!eval_condition("step_cost_usd > 2.0", &vars).unwrap());
    }

    #[test]
    fn dotted_access_and_logic() {
        let output = Value::Json(serde_json::json!({"status": "error", "code": 500}));
        let vars = vars(&[("output", output)]);
        assert!(eval_condition("output.status == 'error' and output.code >= 500", &vars).unwrap());
    }

    #[test]
    fn len_builtin() {
        let output = Value::Json(serde_json::json!({"items": [1, 2, 3]}));
        let vars = vars(&[("output", output)]);
        assert!(eval_condition("len(output.items) == 3", &vars).unwrap());
    }

    #[test]
    fn in_operator() {
        let vars = vars(&[("step_id", Value::Scalar("deploy".to_string()))]);
        assert!(eval_condition("'depl' in step_id", &vars).unwrap());
    }

    #[test]
    fn not_and_or() {
        let vars = vars(&[("output", Value::Bool(false))]);
        assert!(eval_condition("not output", &vars).unwrap());
    }

    #[test]
    fn unknown_identifier_errors() {
        let vars = HashMap::new();
        assert!(eval_condition("missing == 1", &vars).is_err());
    }
}

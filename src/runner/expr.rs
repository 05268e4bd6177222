//! Small expression evaluator for plan conditions and watch expressions
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | compare
//! compare := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/") unary)*
//! unary   := "-" unary | atom
//! atom    := number | string | True | False | None | $name | "(" or ")"
//! ```
//!
//! `$name` reads a variable from the store without interpolating it first.

use std::cmp::Ordering;

use serde_json::{json, Value};

use crate::common::{Error, Result};
use crate::debugger::evaluator::is_truthy;
use crate::debugger::{Evaluator, VariableStore};

/// Evaluator used by the plan runner and the debug session
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleEvaluator;

impl Evaluator for SimpleEvaluator {
    fn evaluate(&self, expression: &str, store: &dyn VariableStore) -> Result<Value> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(Error::Evaluation("Empty expression".to_string()));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            store,
        };
        let value = parser.or()?;
        match parser.peek() {
            None => Ok(value),
            Some(token) => Err(Error::Evaluation(format!("Unexpected {:?}", token))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Word(String),
    Variable(String),
    Op(&'static str),
    Open,
    Close,
}

const OPERATORS: [&str; 10] = ["==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/"];

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '(' || c == ')' {
            tokens.push(if c == '(' { Token::Open } else { Token::Close });
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let end = chars[i + 1..]
                .iter()
                .position(|&ch| ch == c)
                .ok_or_else(|| Error::Evaluation("Unterminated string".to_string()))?;
            tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
            i += end + 2;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let number = if literal.contains('.') {
                literal.parse::<f64>().ok().map(|f| json!(f))
            } else {
                literal.parse::<i64>().ok().map(|n| json!(n))
            };
            let number = number.ok_or_else(|| Error::Evaluation(format!("Invalid number '{}'", literal)))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if c == '$' || c.is_alphabetic() || c == '_' {
            let start = if c == '$' { i + 1 } else { i };
            i = start;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if c == '$' {
                if word.is_empty() {
                    return Err(Error::Evaluation("Expected a variable name after '$'".to_string()));
                }
                tokens.push(Token::Variable(word));
            } else {
                tokens.push(Token::Word(word));
            }
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = OPERATORS
            .iter()
            .copied()
            .find(|op| rest.starts_with(*op))
            .ok_or_else(|| Error::Evaluation(format!("Unexpected character '{}'", c)))?;
        tokens.push(Token::Op(op));
        i += op.len();
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    store: &'a dyn VariableStore,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w == word) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn or(&mut self) -> Result<Value> {
        let mut left = self.and()?;
        while self.eat_word("or") {
            let right = self.and()?;
            left = if is_truthy(&left) { left } else { right };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value> {
        let mut left = self.not()?;
        while self.eat_word("and") {
            let right = self.not()?;
            left = if is_truthy(&left) { right } else { left };
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Value> {
        if self.eat_word("not") {
            let value = self.not()?;
            return Ok(Value::Bool(!is_truthy(&value)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Value> {
        let left = self.sum()?;
        let Some(op) = self.eat_op(&["==", "!=", "<", "<=", ">", ">="]) else {
            return Ok(left);
        };
        let right = self.sum()?;

        let result = match op {
            "==" => equal(&left, &right),
            "!=" => !equal(&left, &right),
            _ => {
                let ordering = order(&left, &right)?;
                match op {
                    "<" => ordering == Ordering::Less,
                    "<=" => ordering != Ordering::Greater,
                    ">" => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn sum(&mut self) -> Result<Value> {
        let mut left = self.product()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.product()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn product(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/"]) {
            let right = self.unary()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value> {
        if self.eat_op(&["-"]).is_some() {
            let value = self.unary()?;
            return arithmetic("-", &json!(0), &value);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Variable(name)) => self.store.resolve(&name),
            Some(Token::Word(word)) => match word.as_str() {
                "True" | "true" => Ok(Value::Bool(true)),
                "False" | "false" => Ok(Value::Bool(false)),
                "None" | "null" => Ok(Value::Null),
                other => Err(Error::Evaluation(format!("name '{}' is not defined", other))),
            },
            Some(Token::Open) => {
                let value = self.or()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err(Error::Evaluation("Expected ')'".to_string())),
                }
            }
            Some(token) => Err(Error::Evaluation(format!("Unexpected {:?}", token))),
            None => Err(Error::Evaluation("Unexpected end of expression".to_string())),
        }
    }
}

fn equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering> {
    let ordering = match (left, right) {
        (Value::Number(_), Value::Number(_)) => left
            .as_f64()
            .zip(right.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.ok_or_else(|| {
        Error::Evaluation(format!("Cannot compare {} and {}", left, right))
    })
}

fn arithmetic(op: &str, left: &Value, right: &Value) -> Result<Value> {
    if let (Value::String(a), Value::String(b), "+") = (left, right, op) {
        return Ok(Value::String(format!("{}{}", a, b)));
    }

    let unsupported = || Error::Evaluation(format!("Unsupported operand for '{}': {} and {}", op, left, right));

    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let integer = match op {
            "+" => a.checked_add(b),
            "-" => a.checked_sub(b),
            "*" => a.checked_mul(b),
            _ => None,
        };
        if let Some(n) = integer {
            return Ok(json!(n));
        }
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(unsupported());
    };
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" if b == 0.0 => return Err(Error::Evaluation("division by zero".to_string())),
        "/" => a / b,
        _ => return Err(unsupported()),
    };
    Ok(json!(result))
}

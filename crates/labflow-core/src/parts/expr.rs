//! A deliberately small expression language for built-in parts.
//!
//! An expression is a single operand or `<operand> <op> <operand>`. Operands
//! are `{name}` references or JSON literals (`3`, `2.5`, `"text"`, `true`,
//! `null`). Operators are `== != < <= > >=` and `+ - * /`.

use labflow_proto::{PartError, Value};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Name(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expr {
    lhs: Operand,
    rhs: Option<(Op, Operand)>,
}

#[derive(Debug)]
enum Token {
    Operand(String),
    Op(Op),
}

const OPERATOR_CHARS: &[char] = &['=', '!', '<', '>', '+', '-', '*', '/'];

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let expects_operand = !matches!(tokens.last(), Some(Token::Operand(_)));

        if c.is_whitespace() {
            i += 1;
        } else if c == '{' {
            let end = chars[i..]
                .iter()
                .position(|&ch| ch == '}')
                .ok_or_else(|| format!("unterminated '{{' in '{text}'"))?;
            tokens.push(Token::Operand(chars[i..=i + end].iter().collect()));
            i += end + 1;
        } else if c == '"' {
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '"' {
                j += if chars[j] == '\\' { 2 } else { 1 };
            }
            if j >= chars.len() {
                return Err(format!("unterminated string in '{text}'"));
            }
            tokens.push(Token::Operand(chars[i..=j].iter().collect()));
            i = j + 1;
        } else if OPERATOR_CHARS.contains(&c) && !(c == '-' && expects_operand) {
            let next = chars.get(i + 1).copied();
            let (op, width) = match (c, next) {
                ('=', Some('=')) => (Op::Eq, 2),
                ('!', Some('=')) => (Op::Ne, 2),
                ('<', Some('=')) => (Op::Le, 2),
                ('>', Some('=')) => (Op::Ge, 2),
                ('<', _) => (Op::Lt, 1),
                ('>', _) => (Op::Gt, 1),
                ('+', _) => (Op::Add, 1),
                ('-', _) => (Op::Sub, 1),
                ('*', _) => (Op::Mul, 1),
                ('/', _) => (Op::Div, 1),
                _ => return Err(format!("unexpected '{c}' in '{text}'")),
            };
            tokens.push(Token::Op(op));
            i += width;
        } else {
            let start = i;
            i += 1;
            while i < chars.len() {
                let ch = chars[i];
                let exponent_sign = ch == '-' && matches!(chars[i - 1], 'e' | 'E');
                if ch.is_whitespace()
                    || ch == '{'
                    || ch == '"'
                    || (OPERATOR_CHARS.contains(&ch) && !exponent_sign)
                {
                    break;
                }
                i += 1;
            }
            tokens.push(Token::Operand(chars[start..i].iter().collect()));
        }
    }

    Ok(tokens)
}

fn parse_operand(raw: &str) -> Result<Operand, String> {
    if let Some(inner) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        let name = inner.trim();
        if name.is_empty() {
            return Err("empty '{}' reference".to_string());
        }
        return Ok(Operand::Name(name.to_string()));
    }
    serde_json::from_str::<Value>(raw)
        .map(Operand::Literal)
        .map_err(|_| format!("'{raw}' is neither a {{name}} reference nor a JSON literal"))
}

impl Expr {
    pub(crate) fn parse(text: &str) -> Result<Self, String> {
        let mut tokens = tokenize(text)?.into_iter();
        let lhs = match tokens.next() {
            Some(Token::Operand(raw)) => parse_operand(&raw)?,
            Some(Token::Op(op)) => return Err(format!("expression starts with '{op}'")),
            None => return Err("empty expression".to_string()),
        };
        let rhs = match (tokens.next(), tokens.next()) {
            (None, _) => None,
            (Some(Token::Op(op)), Some(Token::Operand(raw))) => Some((op, parse_operand(&raw)?)),
            _ => return Err(format!("'{text}' is not of the form <operand> <op> <operand>")),
        };
        if tokens.next().is_some() {
            return Err(format!("'{text}' has more than one operator"));
        }
        Ok(Self { lhs, rhs })
    }

    /// Names referenced with `{name}`.
    pub(crate) fn names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for operand in std::iter::once(&self.lhs).chain(self.rhs.as_ref().map(|(_, o)| o)) {
            if let Operand::Name(name) = operand {
                names.push(name.as_str());
            }
        }
        names
    }

    /// Evaluates with `lookup` resolving `{name}` references.
    pub(crate) fn evaluate(
        &self,
        lookup: &dyn Fn(&str) -> Result<Value, PartError>,
    ) -> Result<Value, PartError> {
        let resolve = |operand: &Operand| match operand {
            Operand::Name(name) => lookup(name),
            Operand::Literal(value) => Ok(value.clone()),
        };
        let lhs = resolve(&self.lhs)?;
        match &self.rhs {
            None => Ok(lhs),
            Some((op, rhs)) => apply(*op, &lhs, &resolve(rhs)?),
        }
    }
}

/// Truthiness used by conditions: `null`, `false`, `0`, `""`, `[]`, `{}` are false.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn number(f: f64) -> Result<Value, PartError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| PartError::serialization(format!("result {f} is not a finite number")))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(op: Op, a: &Value, b: &Value) -> Result<Ordering, PartError> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ordering.ok_or_else(|| PartError::execution(format!("cannot evaluate {a} {op} {b}")))
}

fn arithmetic(op: Op, a: &Value, b: &Value) -> Result<Value, PartError> {
    if let (Value::String(x), Value::String(y), Op::Add) = (a, b, op) {
        return Ok(Value::String(format!("{x}{y}")));
    }
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(PartError::execution(format!("cannot evaluate {a} {op} {b}")));
    };

    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        let exact = match op {
            Op::Add => x.checked_add(y),
            Op::Sub => x.checked_sub(y),
            Op::Mul => x.checked_mul(y),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::from(result));
        }
    }

    let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) else {
        return Err(PartError::execution(format!("cannot evaluate {a} {op} {b}")));
    };
    match op {
        Op::Add => number(x + y),
        Op::Sub => number(x - y),
        Op::Mul => number(x * y),
        Op::Div if y == 0.0 => Err(PartError::execution(format!("division by zero in {a} / {b}"))),
        Op::Div => number(x / y),
        _ => Err(PartError::execution(format!("cannot evaluate {a} {op} {b}"))),
    }
}

fn apply(op: Op, a: &Value, b: &Value) -> Result<Value, PartError> {
    match op {
        Op::Eq => Ok(Value::Bool(values_equal(a, b))),
        Op::Ne => Ok(Value::Bool(!values_equal(a, b))),
        Op::Lt => Ok(Value::Bool(compare(op, a, b)? == Ordering::Less)),
        Op::Le => Ok(Value::Bool(compare(op, a, b)? != Ordering::Greater)),
        Op::Gt => Ok(Value::Bool(compare(op, a, b)? == Ordering::Greater)),
        Op::Ge => Ok(Value::Bool(compare(op, a, b)? != Ordering::Less)),
        Op::Add | Op::Sub | Op::Mul | Op::Div => arithmetic(op, a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_proto::FailureKind;
    use serde_json::json;

    fn eval(text: &str, x: Value) -> Result<Value, PartError> {
        let expr = Expr::parse(text).unwrap();
        expr.evaluate(&|name| {
            if name == "x" {
                Ok(x.clone())
            } else {
                Err(PartError::execution(format!("'{name}' is missing")))
            }
        })
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("{x} > 3", json!(5)).unwrap(), json!(true));
        assert_eq!(eval("{x} <= 3", json!(5)).unwrap(), json!(false));
        assert_eq!(eval("{x} == 3.0", json!(3)).unwrap(), json!(true));
        assert_eq!(eval("{x} != \"a\"", json!("b")).unwrap(), json!(true));
        assert_eq!(eval("{x} < \"b\"", json!("a")).unwrap(), json!(true));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("{x} + 2", json!(40)).unwrap(), json!(42));
        assert_eq!(eval("{x} - -2", json!(1)).unwrap(), json!(3));
        assert_eq!(eval("{x} * 0.5", json!(3)).unwrap(), json!(1.5));
        assert_eq!(eval("{x} / 2", json!(3)).unwrap(), json!(1.5));
        assert_eq!(eval("{x} + \"!\"", json!("hi")).unwrap(), json!("hi!"));
        assert_eq!(eval("{x}-1", json!(3)).unwrap(), json!(2));
    }

    #[test]
    fn test_single_operand() {
        assert_eq!(eval("{x}", json!([1])).unwrap(), json!([1]));
        assert_eq!(eval("-1.5e-3", json!(null)).unwrap(), json!(-0.0015));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            eval("{x} / 0", json!(1)).unwrap_err().kind,
            FailureKind::PartExecutionFailure
        );
        assert!(eval("{x} > 1", json!("a")).is_err());
        assert!(eval("{y} > 1", json!(1)).is_err());
        assert_eq!(
            eval("{x} * 1e308", json!(1e308)).unwrap_err().kind,
            FailureKind::SerializationError
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("{x} >").is_err());
        assert!(Expr::parse("{x} > 1 > 2").is_err());
        assert!(Expr::parse("{x = 1").is_err());
        assert!(Expr::parse("bare_word").is_err());
        assert!(Expr::parse("{x} = 1").is_err());
    }

    #[test]
    fn test_names() {
        let expr = Expr::parse("{a} + {b}").unwrap();
        assert_eq!(expr.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!(0.1)));
        assert!(truthy(&json!({"k": 1})));
    }
}

//! Expression evaluation over a [`Scope`].

use crate::context::{lookup_field, type_name, value_text, Scope};
use crate::error::ValueError;
use crate::escalation;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use weave_core::{BinOp, IrExpr};

pub fn evaluate(expr: &IrExpr, scope: &Scope) -> Result<Value, ValueError> {
    match expr {
        IrExpr::Literal { value } => Ok(value.clone()),
        IrExpr::Var { name } => scope.get(name).cloned(),
        IrExpr::Path { name, path } => scope.get_path(name, path).cloned(),
        IrExpr::List { items } => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        IrExpr::Map { entries } => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), evaluate(value, scope)?);
            }
            Ok(Value::Object(map))
        }
        IrExpr::Binary { op: BinOp::And, left, right } => {
            if !truthy(&evaluate(left, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(right, scope)?)))
        }
        IrExpr::Binary { op: BinOp::Or, left, right } => {
            if truthy(&evaluate(left, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(right, scope)?)))
        }
        IrExpr::Binary { op, left, right } => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            apply(*op, &left, &right)
        }
        IrExpr::Not { operand } => Ok(Value::Bool(!truthy(&evaluate(operand, scope)?))),
        IrExpr::Filter { list, path, op, value } => {
            let items = match evaluate(list, scope)? {
                Value::Array(items) => items,
                other => {
                    return Err(ValueError::TypeMismatch {
                        path: list.to_string(),
                        expected: "a list",
                        found: type_name(&other),
                    })
                }
            };
            let wanted = evaluate(value, scope)?;
            let mut kept = Vec::new();
            for item in items {
                // elements without the field never match
                let Some(field) = lookup_field(&item, path) else {
                    continue;
                };
                if truthy(&apply(*op, &field, &wanted)?) {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
    }
}

/// Apply a non-short-circuit binary operator.
pub fn apply(op: BinOp, left: &Value, right: &Value) -> Result<Value, ValueError> {
    let result = match op {
        BinOp::Eq => Value::Bool(loosely_equal(left, right)),
        BinOp::NotEq => Value::Bool(!loosely_equal(left, right)),
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let ordering = compare(op, left, right)?;
            Value::Bool(match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::LtEq => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
        BinOp::Similar => Value::Bool(escalation::similar(&value_text(left), &value_text(right))),
        BinOp::Contains => Value::Bool(contains(op, left, right)?),
        BinOp::And => Value::Bool(truthy(left) && truthy(right)),
        BinOp::Or => Value::Bool(truthy(left) || truthy(right)),
        BinOp::Add => add(left, right)?,
        BinOp::Sub => subtract(left, right)?,
    };
    Ok(result)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality where `1` and `1.0` are the same number.
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| loosely_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map_or(false, |other| loosely_equal(v, other)))
        }
        _ => left == right,
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<Ordering, ValueError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.ok_or_else(|| operands(op, left, right))
}

fn contains(op: BinOp, haystack: &Value, needle: &Value) -> Result<bool, ValueError> {
    match haystack {
        Value::String(s) => Ok(s.contains(value_text(needle).as_str())),
        Value::Array(items) => Ok(items.iter().any(|item| loosely_equal(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Err(operands(op, haystack, needle)),
        },
        _ => Err(operands(op, haystack, needle)),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, ValueError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(sum) = a.checked_add(b) {
                    return Ok(Value::from(sum));
                }
            }
            float(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
        }
        (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, value_text(b)))),
        (Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(operands(BinOp::Add, left, right)),
    }
}

fn subtract(left: &Value, right: &Value) -> Result<Value, ValueError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(diff) = a.checked_sub(b) {
                    return Ok(Value::from(diff));
                }
            }
            float(a.as_f64().unwrap_or(0.0) - b.as_f64().unwrap_or(0.0))
        }
        _ => Err(operands(BinOp::Sub, left, right)),
    }
}

fn float(f: f64) -> Result<Value, ValueError> {
    Ok(Number::from_f64(f).map_or(Value::Null, Value::Number))
}

fn operands(op: BinOp, left: &Value, right: &Value) -> ValueError {
    ValueError::Operands {
        op: op.symbol(),
        left: type_name(left),
        right: type_name(right),
    }
}

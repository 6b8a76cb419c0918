//! Value helpers shared by the evaluator, the stream operators and the
//! in-memory namespace.
//!
//! - compare_values: total order over JSON values
//! - values_equal: equality under that order
//! - OrderedValue: a value usable as an ordered set or map key
//! - number_value: f64 back to JSON, integral results as integers
//! - expect_*: typed views of a value, failing with a runtime error

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::backtrace::Backtrace;
use crate::error::{RuntimeError, RuntimeResult};

/// Rank of each JSON type in the total order.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two JSON values for ordering.
///
/// Null < Bool < Number < String < Array < Object. Arrays compare element
/// by element, a shorter prefix first. Objects compare as their key-sorted
/// `(key, value)` sequences the same way.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a_f64 = a.as_f64().unwrap_or(0.0);
            let b_f64 = b.as_f64().unwrap_or(0.0);
            a_f64.partial_cmp(&b_f64).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            compare_sequences(a.iter(), b.iter(), |x, y| compare_values(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut a_entries: Vec<(&String, &Value)> = a.iter().collect();
            let mut b_entries: Vec<(&String, &Value)> = b.iter().collect();
            a_entries.sort_by(|x, y| x.0.cmp(y.0));
            b_entries.sort_by(|x, y| x.0.cmp(y.0));
            compare_sequences(a_entries.into_iter(), b_entries.into_iter(), |x, y| {
                x.0.cmp(y.0).then_with(|| compare_values(x.1, y.1))
            })
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_sequences<T, I, F>(mut a: I, mut b: I, mut cmp: F) -> Ordering
where
    I: Iterator<Item = T>,
    F: FnMut(&T, &T) -> Ordering,
{
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match cmp(&x, &y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Equality under [`compare_values`]; `1` and `1.0` are equal.
#[inline]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    compare_values(left, right) == Ordering::Equal
}

/// A JSON value ordered by [`compare_values`], for ordered sets and map
/// keys.
#[derive(Debug, Clone)]
pub struct OrderedValue(pub Value);

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedValue {}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

/// Convert an arithmetic result back to JSON. Integral values become JSON
/// integers. Returns `None` for NaN and infinities.
pub fn number_value(n: f64) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    // 2^53: every integer below it is exact in f64.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Some(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n).map(Value::Number)
}

/// Name of a value's JSON type, for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_error(expected: &str, value: &Value, backtrace: &Backtrace) -> RuntimeError {
    RuntimeError::new(
        format!("expected {} but found {}", expected, json_type_name(value)),
        backtrace,
    )
}

pub fn expect_bool(value: &Value, backtrace: &Backtrace) -> RuntimeResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| type_error("a boolean", value, backtrace))
}

pub fn expect_number(value: &Value, backtrace: &Backtrace) -> RuntimeResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| type_error("a number", value, backtrace))
}

/// An integral number, such as a limit, a count or an index.
pub fn expect_integer(value: &Value, backtrace: &Backtrace) -> RuntimeResult<i64> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => Ok(f as i64),
        _ => Err(type_error("an integer", value, backtrace)),
    }
}

pub fn expect_object<'a>(
    value: &'a Value,
    backtrace: &Backtrace,
) -> RuntimeResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| type_error("an object", value, backtrace))
}

pub fn expect_array<'a>(value: &'a Value, backtrace: &Backtrace) -> RuntimeResult<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| type_error("an array", value, backtrace))
}

/// Resolve a possibly negative index against a sequence of `len` elements.
pub fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

/// Clamp a possibly negative slice bound into `0..=len`.
pub fn clamp_bound(bound: i64, len: usize) -> usize {
    let len = len as i64;
    let resolved = if bound < 0 { len + bound } else { bound };
    resolved.clamp(0, len) as usize
}

/// Look up `attr` in an object document.
pub fn get_attr<'a>(doc: &'a Value, attr: &str, backtrace: &Backtrace) -> RuntimeResult<&'a Value> {
    expect_object(doc, backtrace)?.get(attr).ok_or_else(|| {
        RuntimeError::new(format!("object is missing attribute '{}'", attr), backtrace)
    })
}

/// Canonical text of a key value, used for shard routing and key maps.
pub fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => match number_value(n.as_f64().unwrap_or(0.0)) {
            Some(v) => v.to_string(),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

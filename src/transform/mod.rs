//! Interpreter for the transform DSL used by ties.
//!
//! A [`Transform`] names a pure function, carries its arguments and a
//! linear `next` continuation. [`apply`] runs a list of transforms as a
//! pipeline: each result is the input of the following transform. Nested
//! transforms (the predicate of `Filter`, the branches of `If`) live inside
//! `args` and run to completion before the outer chain continues.
//!
//! Arguments of the exact shape `{"identity": .., "aspect": ..}` are
//! references that resolve live through an [`AspectSource`]; anything else
//! is a literal. Unresolvable references, unknown transform names and
//! type mismatches all degrade to `null` instead of failing.

mod array;
mod conditional;
mod numeric;
mod object;
mod string;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a transform pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Name of the function, e.g. `"ToUpper"`.
    pub transform: String,
    /// Function arguments; values may be aspect references or nested
    /// transforms depending on the function.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Continuation applied to this transform's result.
    #[serde(default)]
    pub next: Vec<Transform>,
}

impl Transform {
    /// A transform with no arguments and no continuation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            transform: name.into(),
            args: Map::new(),
            next: Vec::new(),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Append `next` to this transform's continuation.
    pub fn then(mut self, next: Transform) -> Self {
        self.next.push(next);
        self
    }
}

/// Live lookup of other components' aspects.
pub trait AspectSource {
    /// Current value of `identity.aspect`, or `None` if it does not exist.
    fn get_aspect(&self, identity: &str, aspect: &str) -> Option<Value>;
}

impl<F> AspectSource for F
where
    F: Fn(&str, &str) -> Option<Value>,
{
    fn get_aspect(&self, identity: &str, aspect: &str) -> Option<Value> {
        self(identity, aspect)
    }
}

/// An [`AspectSource`] that resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAspects;

impl AspectSource for NoAspects {
    fn get_aspect(&self, _identity: &str, _aspect: &str) -> Option<Value> {
        None
    }
}

/// Run `chain` as a pipeline over `value`.
pub fn apply(chain: &[Transform], value: Value, source: &dyn AspectSource) -> Value {
    chain.iter().fold(value, |value, step| {
        execute(&step.transform, value, &step.args, &step.next, source)
    })
}

/// Run the function `name` on `value`, then its `next` continuation.
pub fn execute(
    name: &str,
    value: Value,
    args: &Map<String, Value>,
    next: &[Transform],
    source: &dyn AspectSource,
) -> Value {
    let context = Context { args, source };
    let output = match lookup(name) {
        Some(op) => op(value, &context),
        None => {
            tracing::warn!(transform = %name, "unknown transform, yielding null");
            Value::Null
        }
    };
    apply(next, output, source)
}

type Op = fn(Value, &Context<'_>) -> Value;

fn lookup(name: &str) -> Option<Op> {
    string::lookup(name)
        .or_else(|| numeric::lookup(name))
        .or_else(|| array::lookup(name))
        .or_else(|| object::lookup(name))
        .or_else(|| conditional::lookup(name))
}

/// Arguments of one transform invocation plus the aspect source.
pub(crate) struct Context<'a> {
    args: &'a Map<String, Value>,
    source: &'a dyn AspectSource,
}

impl Context<'_> {
    /// Raw argument, unresolved.
    fn raw(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Argument with aspect references resolved; missing is `null`.
    fn arg(&self, name: &str) -> Value {
        self.raw(name).map(|v| self.resolve(v)).unwrap_or(Value::Null)
    }

    fn resolve(&self, value: &Value) -> Value {
        match aspect_reference(value) {
            Some((identity, aspect)) => self
                .source
                .get_aspect(identity, aspect)
                .unwrap_or(Value::Null),
            None => value.clone(),
        }
    }

    /// Argument interpreted as a nested chain.
    fn chain(&self, name: &str) -> Option<Vec<Transform>> {
        self.raw(name).and_then(parse_chain)
    }

    fn run(&self, chain: &[Transform], value: Value) -> Value {
        apply(chain, value, self.source)
    }

    /// Evaluate an argument that may be a chain (applied to `input`) or a
    /// literal/reference.
    fn eval(&self, raw: &Value, input: &Value) -> Value {
        match parse_chain(raw) {
            Some(chain) => self.run(&chain, input.clone()),
            None => self.resolve(raw),
        }
    }

    fn text_arg(&self, name: &str) -> Option<String> {
        match self.arg(name) {
            Value::Null => None,
            value => Some(as_text(&value)),
        }
    }

    fn number_arg(&self, name: &str) -> Option<f64> {
        as_number(&self.arg(name))
    }

    fn index_arg(&self, name: &str) -> Option<i64> {
        self.number_arg(name).map(|n| n.trunc() as i64)
    }
}

fn aspect_reference(value: &Value) -> Option<(&str, &str)> {
    let object = value.as_object()?;
    if object.len() != 2 {
        return None;
    }
    Some((
        object.get("identity")?.as_str()?,
        object.get("aspect")?.as_str()?,
    ))
}

fn is_transform(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.get("transform").is_some_and(Value::is_string))
}

/// A transform object or a non-empty list of transform objects.
fn parse_chain(value: &Value) -> Option<Vec<Transform>> {
    match value {
        Value::Object(_) if is_transform(value) => {
            serde_json::from_value(value.clone()).ok().map(|t| vec![t])
        }
        Value::Array(items) if !items.is_empty() && items.iter().all(is_transform) => {
            serde_json::from_value(value.clone()).ok()
        }
        _ => None,
    }
}

/// JavaScript-style truthiness.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form of a value: strings as-is, integral numbers without a
/// fraction, containers as JSON.
pub(crate) fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Numeric form of a value, if it has one.
pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// JSON number for `f`: integral values become integers, non-finite `null`.
pub(crate) fn number(f: f64) -> Value {
    if !f.is_finite() {
        return Value::Null;
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Value::from(f as i64);
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Equality where `1` and `1.0` are the same number.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering of two scalars: numbers numerically, strings lexically.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}

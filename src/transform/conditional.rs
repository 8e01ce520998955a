//! Comparisons, boolean combinators and branch selection.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::Value;

use super::{Context, Op, as_text, compare, loose_eq, parse_chain, truthy};

pub(super) fn lookup(name: &str) -> Option<Op> {
    Some(match name {
        "If" => if_,
        "Equals" => equals,
        "NotEquals" => not_equals,
        "GreaterThan" => greater_than,
        "GreaterThanOrEqual" => greater_than_or_equal,
        "LessThan" => less_than,
        "LessThanOrEqual" => less_than_or_equal,
        "And" => and,
        "Or" => or,
        "Not" => not,
        "Truthy" => truthy_,
        "IsEmpty" => is_empty,
        "Match" => match_,
        "Constant" => constant,
        _ => return None,
    })
}

/// `condition` is a chain applied to the input (or a literal/reference);
/// `then`/`else` are chains applied to the input or literal values. A
/// missing branch passes the input through.
fn if_(value: Value, cx: &Context<'_>) -> Value {
    let holds = cx
        .raw("condition")
        .is_some_and(|condition| truthy(&cx.eval(condition, &value)));
    let branch = if holds { "then" } else { "else" };
    match cx.raw(branch) {
        Some(raw) => cx.eval(raw, &value),
        None => value,
    }
}

fn equals(value: Value, cx: &Context<'_>) -> Value {
    Value::Bool(loose_eq(&value, &cx.arg("value")))
}

fn not_equals(value: Value, cx: &Context<'_>) -> Value {
    Value::Bool(!loose_eq(&value, &cx.arg("value")))
}

fn ordered(value: &Value, cx: &Context<'_>, accept: fn(Ordering) -> bool) -> Value {
    Value::Bool(compare(value, &cx.arg("value")).is_some_and(accept))
}

fn greater_than(value: Value, cx: &Context<'_>) -> Value {
    ordered(&value, cx, Ordering::is_gt)
}

fn greater_than_or_equal(value: Value, cx: &Context<'_>) -> Value {
    ordered(&value, cx, Ordering::is_ge)
}

fn less_than(value: Value, cx: &Context<'_>) -> Value {
    ordered(&value, cx, Ordering::is_lt)
}

fn less_than_or_equal(value: Value, cx: &Context<'_>) -> Value {
    ordered(&value, cx, Ordering::is_le)
}

/// Each entry of `conditions` is a transform, a list of transforms, or a
/// literal. Evaluation short-circuits.
fn conditions<'c>(cx: &'c Context<'_>, input: &'c Value) -> impl Iterator<Item = bool> + 'c {
    let entries: &[Value] = match cx.raw("conditions") {
        Some(Value::Array(entries)) => entries.as_slice(),
        _ => &[],
    };
    entries.iter().map(move |entry| match parse_chain(entry) {
        Some(chain) => truthy(&cx.run(&chain, input.clone())),
        None => truthy(&cx.resolve(entry)),
    })
}

fn and(value: Value, cx: &Context<'_>) -> Value {
    Value::Bool(conditions(cx, &value).all(|holds| holds))
}

fn or(value: Value, cx: &Context<'_>) -> Value {
    Value::Bool(conditions(cx, &value).any(|holds| holds))
}

fn not(value: Value, _: &Context<'_>) -> Value {
    Value::Bool(!truthy(&value))
}

fn truthy_(value: Value, _: &Context<'_>) -> Value {
    Value::Bool(truthy(&value))
}

fn is_empty(value: Value, _: &Context<'_>) -> Value {
    Value::Bool(match &value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    })
}

/// Regex test against the input's text. `flags` may contain `i`, `m`, `s`.
fn match_(value: Value, cx: &Context<'_>) -> Value {
    let Some(pattern) = cx.text_arg("pattern") else {
        return Value::Bool(false);
    };
    let flags = cx.text_arg("flags").unwrap_or_default();
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build();
    match regex {
        Ok(re) => Value::Bool(!value.is_null() && re.is_match(&as_text(&value))),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid Match pattern");
            Value::Bool(false)
        }
    }
}

fn constant(_: Value, cx: &Context<'_>) -> Value {
    cx.arg("value")
}

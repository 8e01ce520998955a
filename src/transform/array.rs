//! Array transforms. `Map`, `Filter` and `Reduce` take a nested chain in
//! their `transform` argument.

use std::cmp::Ordering;

use serde_json::{Value, json};

use super::object::get_path;
use super::{Context, Op, compare, loose_eq, truthy};

pub(super) fn lookup(name: &str) -> Option<Op> {
    Some(match name {
        "Slice" => slice,
        "Map" => map,
        "Filter" => filter,
        "Reduce" => reduce,
        "Sort" => sort,
        "Zip" => zip,
        "Unique" => unique,
        "Reverse" => reverse,
        "Flatten" => flatten,
        "First" => first,
        "Last" => last,
        "Index" => index,
        "Includes" => includes,
        "Concat" => concat,
        "Length" => length,
        _ => return None,
    })
}

/// Resolve a possibly negative index against `len`, clamped to `0..=len`.
fn offset(index: i64, len: usize) -> usize {
    let len_i = len as i64;
    let resolved = if index < 0 { len_i + index } else { index };
    resolved.clamp(0, len_i) as usize
}

fn slice(value: Value, cx: &Context<'_>) -> Value {
    let bounds = |len: usize| {
        let start = offset(cx.index_arg("start").unwrap_or(0), len);
        let end = cx.index_arg("end").map_or(len, |e| offset(e, len));
        (start, end.max(start))
    };
    match value {
        Value::Array(items) => {
            let (start, end) = bounds(items.len());
            Value::Array(items[start..end].to_vec())
        }
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            let (start, end) = bounds(chars.len());
            Value::String(chars[start..end].iter().collect())
        }
        _ => Value::Null,
    }
}

fn map(value: Value, cx: &Context<'_>) -> Value {
    let Some(chain) = cx.chain("transform") else {
        return value;
    };
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| cx.run(&chain, item))
                .collect(),
        ),
        other => other,
    }
}

fn filter(value: Value, cx: &Context<'_>) -> Value {
    let Some(chain) = cx.chain("transform") else {
        return value;
    };
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| truthy(&cx.run(&chain, item.clone())))
                .collect(),
        ),
        other => other,
    }
}

/// The chain receives `{accumulator, value, index}` and returns the next
/// accumulator.
fn reduce(value: Value, cx: &Context<'_>) -> Value {
    let initial = cx.arg("initial");
    let (Value::Array(items), Some(chain)) = (value, cx.chain("transform")) else {
        return initial;
    };
    items
        .into_iter()
        .enumerate()
        .fold(initial, |accumulator, (index, item)| {
            cx.run(
                &chain,
                json!({"accumulator": accumulator, "value": item, "index": index}),
            )
        })
}

fn sort(value: Value, cx: &Context<'_>) -> Value {
    let mut items = match value {
        Value::Array(items) => items,
        other => return other,
    };
    let key = cx.text_arg("key");
    let descending = cx.text_arg("direction").as_deref() == Some("desc");
    let pick = |item: &Value| -> Value {
        match &key {
            Some(path) => get_path(item, path).cloned().unwrap_or(Value::Null),
            None => item.clone(),
        }
    };
    items.sort_by(|a, b| {
        let ordering = compare(&pick(a), &pick(b)).unwrap_or(Ordering::Equal);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
    Value::Array(items)
}

fn zip(value: Value, cx: &Context<'_>) -> Value {
    let (Value::Array(left), Value::Array(right)) = (value, cx.arg("other")) else {
        return Value::Null;
    };
    Value::Array(
        left.into_iter()
            .zip(right)
            .map(|(a, b)| Value::Array(vec![a, b]))
            .collect(),
    )
}

fn unique(value: Value, _: &Context<'_>) -> Value {
    let items = match value {
        Value::Array(items) => items,
        other => return other,
    };
    let mut seen: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !seen.iter().any(|s| loose_eq(s, &item)) {
            seen.push(item);
        }
    }
    Value::Array(seen)
}

fn reverse(value: Value, _: &Context<'_>) -> Value {
    match value {
        Value::Array(mut items) => {
            items.reverse();
            Value::Array(items)
        }
        Value::String(text) => Value::String(text.chars().rev().collect()),
        other => other,
    }
}

/// One level deep.
fn flatten(value: Value, _: &Context<'_>) -> Value {
    let items = match value {
        Value::Array(items) => items,
        other => return other,
    };
    let mut flat = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Array(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    Value::Array(flat)
}

fn first(value: Value, _: &Context<'_>) -> Value {
    match value {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn last(value: Value, _: &Context<'_>) -> Value {
    match value {
        Value::Array(items) => items.into_iter().next_back().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn index(value: Value, cx: &Context<'_>) -> Value {
    let (Value::Array(items), Some(i)) = (&value, cx.index_arg("index")) else {
        return Value::Null;
    };
    let position = if i < 0 { items.len() as i64 + i } else { i };
    usize::try_from(position)
        .ok()
        .and_then(|p| items.get(p).cloned())
        .unwrap_or(Value::Null)
}

fn includes(value: Value, cx: &Context<'_>) -> Value {
    let needle = cx.arg("value");
    Value::Bool(match (&value, &needle) {
        (Value::Array(items), _) => items.iter().any(|item| loose_eq(item, &needle)),
        (Value::String(text), Value::String(part)) => text.contains(part.as_str()),
        _ => false,
    })
}

fn concat(value: Value, cx: &Context<'_>) -> Value {
    match (value, cx.arg("other")) {
        (Value::Array(mut items), Value::Array(other)) => {
            items.extend(other);
            Value::Array(items)
        }
        (Value::Array(items), Value::Null) => Value::Array(items),
        (Value::Array(mut items), other) => {
            items.push(other);
            Value::Array(items)
        }
        (Value::String(text), other) => Value::String(text + &super::as_text(&other)),
        (other, _) => other,
    }
}

fn length(value: Value, _: &Context<'_>) -> Value {
    match value {
        Value::Array(items) => json!(items.len()),
        Value::String(text) => json!(text.chars().count()),
        Value::Object(map) => json!(map.len()),
        _ => Value::Null,
    }
}

//! Object transforms. All of them return new values; the input is never
//! modified in place.

use serde_json::{Map, Value};

use super::{Context, Op, as_text};

pub(super) fn lookup(name: &str) -> Option<Op> {
    Some(match name {
        "Pick" => pick,
        "Omit" => omit,
        "Get" => get,
        "Set" => set,
        "Merge" => merge,
        "Keys" => keys,
        "Values" => values,
        _ => return None,
    })
}

/// Follow a dotted path; numeric segments index into arrays. An empty
/// path is the value itself.
pub(super) fn get_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn set_path(target: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        let slot = map.entry((*head).to_owned()).or_insert(Value::Null);
        set_path(slot, rest, value);
    }
}

fn key_list(cx: &Context<'_>) -> Vec<String> {
    match cx.arg("keys") {
        Value::Array(keys) => keys.iter().map(as_text).collect(),
        Value::Null => Vec::new(),
        single => vec![as_text(&single)],
    }
}

fn pick(value: Value, cx: &Context<'_>) -> Value {
    let Value::Object(map) = &value else {
        return Value::Null;
    };
    let keys = key_list(cx);
    Value::Object(
        map.iter()
            .filter(|(k, _)| keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn omit(value: Value, cx: &Context<'_>) -> Value {
    let keys = key_list(cx);
    match value {
        Value::Object(mut map) => {
            map.retain(|k, _| !keys.contains(k));
            Value::Object(map)
        }
        _ => Value::Null,
    }
}

fn get(value: Value, cx: &Context<'_>) -> Value {
    let key = cx.text_arg("key").unwrap_or_default();
    get_path(&value, &key).cloned().unwrap_or(Value::Null)
}

/// Returns a copy of the input with `key` (a dotted path) set to `value`.
fn set(value: Value, cx: &Context<'_>) -> Value {
    let Some(key) = cx.text_arg("key") else {
        return value;
    };
    let mut updated = match value {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };
    let segments: Vec<&str> = key.split('.').collect();
    set_path(&mut updated, &segments, cx.arg("value"));
    updated
}

fn merge_into(base: &mut Map<String, Value>, over: Map<String, Value>, deep: bool) {
    for (key, value) in over {
        match value {
            Value::Object(incoming) if deep => match base.get_mut(&key) {
                Some(Value::Object(existing)) => merge_into(existing, incoming, deep),
                _ => {
                    base.insert(key, Value::Object(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// `direction: "right"` (default) lets `other` win on conflicts, `"left"`
/// keeps the input's values. `deep` merges nested objects key by key.
fn merge(value: Value, cx: &Context<'_>) -> Value {
    let Value::Object(other) = cx.arg("other") else {
        return value;
    };
    let input = match value {
        Value::Object(input) => input,
        value => return value,
    };
    let deep = super::truthy(&cx.arg("deep"));
    let (mut base, over) = match cx.text_arg("direction").as_deref() {
        Some("left") => (other, input),
        _ => (input, other),
    };
    merge_into(&mut base, over, deep);
    Value::Object(base)
}

fn keys(value: Value, _: &Context<'_>) -> Value {
    match value {
        Value::Object(map) => {
            Value::Array(map.into_iter().map(|(k, _)| Value::String(k)).collect())
        }
        _ => Value::Null,
    }
}

fn values(value: Value, _: &Context<'_>) -> Value {
    match value {
        Value::Object(map) => Value::Array(map.into_iter().map(|(_, v)| v).collect()),
        _ => Value::Null,
    }
}

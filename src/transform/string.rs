//! String transforms.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{Context, Op, as_number, as_text, number};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_.]*)\}").expect("placeholder pattern is valid")
});

pub(super) fn lookup(name: &str) -> Option<Op> {
    Some(match name {
        "ToUpper" => to_upper,
        "ToLower" => to_lower,
        "Capitalize" => capitalize,
        "Trim" => trim,
        "Split" => split,
        "Join" => join,
        "Format" => format,
        "Replace" => replace,
        "ToString" => to_string,
        "ToNumber" => to_number,
        _ => return None,
    })
}

fn map_text(value: Value, f: impl FnOnce(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        other => Value::String(f(&as_text(&other))),
    }
}

fn to_upper(value: Value, _: &Context<'_>) -> Value {
    map_text(value, str::to_uppercase)
}

fn to_lower(value: Value, _: &Context<'_>) -> Value {
    map_text(value, str::to_lowercase)
}

fn capitalize(value: Value, _: &Context<'_>) -> Value {
    map_text(value, |text| {
        let mut chars = text.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    })
}

fn trim(value: Value, cx: &Context<'_>) -> Value {
    let side = cx.text_arg("side");
    map_text(value, |text| {
        let trimmed = match side.as_deref() {
            Some("start") => text.trim_start(),
            Some("end") => text.trim_end(),
            _ => text.trim(),
        };
        trimmed.to_owned()
    })
}

fn split(value: Value, cx: &Context<'_>) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let text = as_text(&value);
    let separator = cx.text_arg("separator").unwrap_or_default();
    let parts: Vec<Value> = if separator.is_empty() {
        text.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        text.split(separator.as_str())
            .map(|part| Value::String(part.to_owned()))
            .collect()
    };
    Value::Array(parts)
}

fn join(value: Value, cx: &Context<'_>) -> Value {
    let separator = cx.text_arg("separator").unwrap_or_else(|| ",".to_owned());
    match value {
        Value::Array(items) => Value::String(
            items
                .iter()
                .map(as_text)
                .collect::<Vec<_>>()
                .join(&separator),
        ),
        other => map_text(other, str::to_owned),
    }
}

/// `{}` and `{value}` insert the input; `{key}` inserts a field of an
/// object input, falling back to an argument of the same name.
fn format(value: Value, cx: &Context<'_>) -> Value {
    let Some(template) = cx.text_arg("template") else {
        return map_text(value, str::to_owned);
    };
    let rendered = PLACEHOLDER.replace_all(&template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        if key.is_empty() || key == "value" {
            return as_text(&value);
        }
        match value.as_object().and_then(|o| o.get(key)) {
            Some(field) => as_text(field),
            None => as_text(&cx.arg(key)),
        }
    });
    Value::String(rendered.into_owned())
}

fn replace(value: Value, cx: &Context<'_>) -> Value {
    let Some(pattern) = cx.text_arg("pattern") else {
        return value;
    };
    let replacement = cx.text_arg("replacement").unwrap_or_default();
    if value.is_null() {
        return Value::Null;
    }
    let text = as_text(&value);
    if !super::truthy(&cx.arg("regex")) {
        return Value::String(text.replace(&pattern, &replacement));
    }
    match Regex::new(&pattern) {
        Ok(re) => Value::String(re.replace_all(&text, replacement.as_str()).into_owned()),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid Replace pattern");
            Value::String(text)
        }
    }
}

fn to_string(value: Value, _: &Context<'_>) -> Value {
    map_text(value, str::to_owned)
}

fn to_number(value: Value, _: &Context<'_>) -> Value {
    as_number(&value).map(number).unwrap_or(Value::Null)
}

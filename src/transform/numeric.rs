//! Arithmetic against a literal or resolved `value` argument.

use serde_json::Value;

use super::{Context, Op, as_number, number};

pub(super) fn lookup(name: &str) -> Option<Op> {
    Some(match name {
        "Add" => add,
        "Subtract" => subtract,
        "Multiply" => multiply,
        "Divide" => divide,
        "Modulo" => modulo,
        "Power" => power,
        "Min" => min,
        "Max" => max,
        "Round" => round,
        "Floor" => floor,
        "Ceil" => ceil,
        "Abs" => abs,
        "Negate" => negate,
        "Clamp" => clamp,
        _ => return None,
    })
}

fn binary(value: &Value, cx: &Context<'_>, f: impl FnOnce(f64, f64) -> Option<f64>) -> Value {
    match (as_number(value), cx.number_arg("value")) {
        (Some(a), Some(b)) => f(a, b).map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn unary(value: &Value, f: impl FnOnce(f64) -> f64) -> Value {
    as_number(value).map(|n| number(f(n))).unwrap_or(Value::Null)
}

fn add(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| Some(a + b))
}

fn subtract(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| Some(a - b))
}

fn multiply(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| Some(a * b))
}

fn divide(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| (b != 0.0).then(|| a / b))
}

fn modulo(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| (b != 0.0).then(|| a % b))
}

fn power(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| Some(a.powf(b)))
}

fn min(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| Some(a.min(b)))
}

fn max(value: Value, cx: &Context<'_>) -> Value {
    binary(&value, cx, |a, b| Some(a.max(b)))
}

fn round(value: Value, cx: &Context<'_>) -> Value {
    let digits = cx.index_arg("digits").unwrap_or(0).clamp(0, 15) as i32;
    let factor = 10f64.powi(digits);
    unary(&value, |n| (n * factor).round() / factor)
}

fn floor(value: Value, _: &Context<'_>) -> Value {
    unary(&value, f64::floor)
}

fn ceil(value: Value, _: &Context<'_>) -> Value {
    unary(&value, f64::ceil)
}

fn abs(value: Value, _: &Context<'_>) -> Value {
    unary(&value, f64::abs)
}

fn negate(value: Value, _: &Context<'_>) -> Value {
    unary(&value, |n| -n)
}

/// A missing bound leaves that side open.
fn clamp(value: Value, cx: &Context<'_>) -> Value {
    let low = cx.number_arg("min");
    let high = cx.number_arg("max");
    unary(&value, |mut n| {
        if let Some(low) = low {
            n = n.max(low);
        }
        if let Some(high) = high {
            n = n.min(high);
        }
        n
    })
}

#[cfg(test)]
mod tests {
    use super::super::{NoAspects, Transform, apply};
    use serde_json::{Value, json};

    fn run(t: Transform, value: Value) -> Value {
        apply(&[t], value, &NoAspects)
    }

    #[test]
    fn arithmetic_against_literal() {
        assert_eq!(run(Transform::new("Add").arg("value", 2), json!(3)), json!(5));
        assert_eq!(run(Transform::new("Subtract").arg("value", 5), json!(3)), json!(-2));
        assert_eq!(run(Transform::new("Divide").arg("value", 4), json!(10)), json!(2.5));
        assert_eq!(run(Transform::new("Modulo").arg("value", 3), json!(10)), json!(1));
        assert_eq!(run(Transform::new("Power").arg("value", 3), json!(2)), json!(8));
        assert_eq!(run(Transform::new("Max").arg("value", 3), json!(2)), json!(3));
    }

    #[test]
    fn numeric_strings_are_accepted() {
        assert_eq!(run(Transform::new("Add").arg("value", "1.5"), json!("2")), json!(3.5));
    }

    #[test]
    fn division_by_zero_is_null() {
        assert_eq!(run(Transform::new("Divide").arg("value", 0), json!(1)), Value::Null);
        assert_eq!(run(Transform::new("Modulo").arg("value", 0), json!(1)), Value::Null);
    }

    #[test]
    fn non_numeric_input_is_null() {
        assert_eq!(run(Transform::new("Add").arg("value", 1), json!("x")), Value::Null);
        assert_eq!(run(Transform::new("Add"), json!(1)), Value::Null);
    }

    #[test]
    fn rounding_and_unary() {
        assert_eq!(run(Transform::new("Round"), json!(2.6)), json!(3));
        assert_eq!(run(Transform::new("Round").arg("digits", 2), json!(3.14159)), json!(3.14));
        assert_eq!(run(Transform::new("Floor"), json!(-1.5)), json!(-2));
        assert_eq!(run(Transform::new("Ceil"), json!(1.1)), json!(2));
        assert_eq!(run(Transform::new("Abs"), json!(-4)), json!(4));
        assert_eq!(run(Transform::new("Negate"), json!(4)), json!(-4));
    }

    #[test]
    fn clamp_bounds() {
        let t = Transform::new("Clamp").arg("min", 0).arg("max", 10);
        assert_eq!(run(t.clone(), json!(12)), json!(10));
        assert_eq!(run(t, json!(-3)), json!(0));
        assert_eq!(run(Transform::new("Clamp").arg("max", 1), json!(-3)), json!(-3));
    }
}

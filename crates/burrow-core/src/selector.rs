//! A small Mango-style selector matcher, used to filter the `_changes` feed
//! (`?filter=_selector`) without standing up the full secondary-index query
//! subsystem. Selectors are plain JSON objects: an implicit AND across their
//! top-level fields, each value either a literal to compare for equality or
//! an object of operators.

use serde_json::Value;

/// Does `doc` satisfy `selector`? Missing fields never match anything but
/// `$exists: false`.
pub fn matches(doc: &Value, selector: &Value) -> bool {
    let Some(fields) = selector.as_object() else {
        return false;
    };
    fields.iter().all(|(path, condition)| {
        let actual = lookup(doc, path);
        matches_condition(actual, condition)
    })
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for segment in path.split('.') {
        cur = cur.as_object()?.get(segment)?;
    }
    Some(cur)
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> bool {
    match condition.as_object() {
        Some(ops) if ops.keys().all(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, operand)| matches_operator(actual, op, operand))
        }
        // A plain (non-operator) value is shorthand for `$eq`.
        _ => actual == Some(condition),
    }
}

fn matches_operator(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
        "$in" => operand.as_array().is_some_and(|a| actual.is_some_and(|v| a.contains(v))),
        "$nin" => operand.as_array().is_some_and(|a| !actual.is_some_and(|v| a.contains(v))),
        "$gt" | "$gte" | "$lt" | "$lte" => match (actual.and_then(Value::as_f64), operand.as_f64())
        {
            (Some(a), Some(b)) => match op {
                "$gt" => a > b,
                "$gte" => a >= b,
                "$lt" => a < b,
                _ => a <= b,
            },
            _ => false,
        },
        _ => false,
    }
}

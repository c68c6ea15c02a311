//! Conversion between JSON values and SQLite storage classes

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

/// JSON value to a bindable SQLite value.
/// Booleans become 0/1, arrays and objects are stored as JSON text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Stored SQLite value to JSON. Blobs render as lowercase hex.
pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
    }
}

/// Loose equality between a declared value and a stored one
pub fn values_match(declared: &Value, stored: &Value) -> bool {
    if declared == stored {
        return true;
    }
    match (declared, stored) {
        (Value::Bool(b), Value::Number(n)) | (Value::Number(n), Value::Bool(b)) => {
            n.as_f64() == Some(if *b { 1.0 } else { 0.0 })
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64().is_some() && a.as_f64() == b.as_f64(),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok().is_some_and(|parsed| Some(parsed) == n.as_f64())
        }
        (Value::Array(_) | Value::Object(_), Value::String(s)) => {
            serde_json::from_str::<Value>(s).is_ok_and(|parsed| &parsed == declared)
        }
        _ => false,
    }
}

/// Stable text form of key values, shared by snapshots and changeset lookups
pub fn key_text(values: &[&Value]) -> String {
    match values {
        [single] => scalar_text(single),
        _ => Value::Array(
            values
                .iter()
                .map(|v| Value::String(scalar_text(v)))
                .collect(),
        )
        .to_string(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => i64::from(*b).to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_to_sql() {
        assert_eq!(json_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&json!(6)), SqlValue::Integer(6));
        assert_eq!(json_to_sql(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(json_to_sql(&json!(null)), SqlValue::Null);
        assert_eq!(json_to_sql(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".to_string()));
    }

    #[test]
    fn test_sql_to_json() {
        assert_eq!(sql_to_json(ValueRef::Integer(3)), json!(3));
        assert_eq!(sql_to_json(ValueRef::Real(f64::NAN)), Value::Null);
        assert_eq!(sql_to_json(ValueRef::Text(b"Tokyo")), json!("Tokyo"));
        assert_eq!(sql_to_json(ValueRef::Blob(&[0xde, 0xad])), json!("dead"));
    }

    #[test]
    fn test_loose_matching() {
        assert!(values_match(&json!(true), &json!(1)));
        assert!(values_match(&json!(false), &json!(0)));
        assert!(values_match(&json!(6), &json!(6.0)));
        assert!(values_match(&json!("6"), &json!(6)));
        assert!(values_match(&json!(["a"]), &json!("[\"a\"]")));
        assert!(!values_match(&json!("Wuhan"), &json!("Tokyo")));
        assert!(!values_match(&json!(true), &json!(2)));
        assert!(!values_match(&json!(null), &json!(0)));
    }

    #[test]
    fn test_key_text() {
        assert_eq!(key_text(&[&json!("OPT_TOKYO")]), "OPT_TOKYO");
        assert_eq!(key_text(&[&json!(5)]), "5");
        assert_eq!(key_text(&[&json!(5.0)]), "5");
        assert_eq!(key_text(&[&json!("a"), &json!(1)]), "[\"a\",\"1\"]");
    }
}

//! Default value coercions for change-field-type operations

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Number, Value};

use crate::schema::FieldType;

/// Convert `value` to `target`. Null passes through unchanged.
pub fn default_conversion(value: &Value, target: FieldType) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match target {
        FieldType::String | FieldType::Reference | FieldType::Bytes => to_string(value),
        FieldType::Number => to_number(value),
        FieldType::Boolean => to_boolean(value),
        FieldType::Array => Ok(to_array(value)),
        FieldType::Timestamp => to_timestamp(value),
        FieldType::Map => to_map(value),
        FieldType::Null => Ok(Value::Null),
        FieldType::Geopoint => bail!("no default conversion to geopoint from {}", value),
    }
}

fn to_string(value: &Value) -> Result<Value> {
    Ok(Value::String(match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other)?,
    }))
}

fn to_number(value: &Value) -> Result<Value> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(u8::from(*b))),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::from(i));
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                return Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| anyhow!("'{}' is not a finite number", s));
            }
            DateTime::parse_from_rfc3339(trimmed)
                .map(|ts| Value::from(ts.timestamp_millis()))
                .map_err(|_| anyhow!("cannot convert '{}' to a number", s))
        }
        other => bail!("cannot convert {} to a number", other),
    }
}

fn to_boolean(value: &Value) -> Result<Value> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "0" | "no" => Ok(Value::Bool(false)),
            _ => bail!("cannot convert '{}' to a boolean", s),
        },
        other => bail!("cannot convert {} to a boolean", other),
    }
}

fn to_array(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}

fn to_timestamp(value: &Value) -> Result<Value> {
    let ts: DateTime<Utc> = match value {
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| anyhow!("cannot convert {} to a timestamp", n))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| anyhow!("{} is out of range for a timestamp", millis))?
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map_err(|e| anyhow!("cannot parse '{}' as RFC 3339: {}", s, e))?
            .with_timezone(&Utc),
        other => bail!("cannot convert {} to a timestamp", other),
    };
    Ok(Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

fn to_map(value: &Value) -> Result<Value> {
    match value {
        Value::Object(_) => Ok(value.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s)? {
            map @ Value::Object(_) => Ok(map),
            other => bail!("'{}' parses to {}, not an object", s, other),
        },
        other => bail!("cannot convert {} to a map", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_string() {
        assert_eq!(default_conversion(&json!(42), FieldType::String).unwrap(), json!("42"));
        assert_eq!(default_conversion(&json!(true), FieldType::String).unwrap(), json!("true"));
        assert_eq!(
            default_conversion(&json!([1, 2]), FieldType::String).unwrap(),
            json!("[1,2]")
        );
    }

    #[test]
    fn test_to_number() {
        assert_eq!(default_conversion(&json!("17"), FieldType::Number).unwrap(), json!(17));
        assert_eq!(default_conversion(&json!(" 2.5 "), FieldType::Number).unwrap(), json!(2.5));
        assert_eq!(default_conversion(&json!(false), FieldType::Number).unwrap(), json!(0));
        assert_eq!(
            default_conversion(&json!("1970-01-01T00:00:01Z"), FieldType::Number).unwrap(),
            json!(1000)
        );
        assert!(default_conversion(&json!("abc"), FieldType::Number).is_err());
        assert!(default_conversion(&json!({"a": 1}), FieldType::Number).is_err());
    }

    #[test]
    fn test_to_boolean() {
        assert_eq!(default_conversion(&json!("yes"), FieldType::Boolean).unwrap(), json!(true));
        assert_eq!(default_conversion(&json!("0"), FieldType::Boolean).unwrap(), json!(false));
        assert_eq!(default_conversion(&json!(3), FieldType::Boolean).unwrap(), json!(true));
        assert!(default_conversion(&json!("maybe"), FieldType::Boolean).is_err());
    }

    #[test]
    fn test_to_array_and_map() {
        assert_eq!(default_conversion(&json!("a"), FieldType::Array).unwrap(), json!(["a"]));
        assert_eq!(default_conversion(&json!([1]), FieldType::Array).unwrap(), json!([1]));
        assert_eq!(
            default_conversion(&json!("{\"k\":1}"), FieldType::Map).unwrap(),
            json!({"k": 1})
        );
        assert!(default_conversion(&json!("[1]"), FieldType::Map).is_err());
    }

    #[test]
    fn test_to_timestamp() {
        assert_eq!(
            default_conversion(&json!(0), FieldType::Timestamp).unwrap(),
            json!("1970-01-01T00:00:00.000Z")
        );
        assert_eq!(
            default_conversion(&json!("2024-03-01T10:00:00+02:00"), FieldType::Timestamp).unwrap(),
            json!("2024-03-01T08:00:00.000Z")
        );
        assert!(default_conversion(&json!(true), FieldType::Timestamp).is_err());
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(default_conversion(&Value::Null, FieldType::Number).unwrap(), Value::Null);
    }
}

use super::types::{FieldInfo, FieldMap, FieldType};
use crate::value::{Row, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Coerce a raw engine value to the declared type of its field.
pub fn coerce(value: Value, info: &FieldInfo) -> Value {
    if info.nullable {
        match &value {
            Value::Null => return Value::Null,
            Value::Text(s) if s.is_empty() => return Value::Null,
            _ => {}
        }
    }

    match info.field_type {
        FieldType::Integer => Value::Int(to_int(&value)),
        FieldType::Float => Value::Float(to_float(&value)),
        FieldType::Boolean => Value::Bool(to_bool(&value)),
        FieldType::Date => Value::Text(normalize_date(&value)),
        FieldType::Datetime => Value::Text(normalize_datetime(&value)),
        FieldType::String | FieldType::Text | FieldType::Choice | FieldType::Binary => {
            match value {
                Value::Text(s) => Value::Text(s),
                other => Value::Text(other.to_text()),
            }
        }
    }
}

/// Coerce every field of a row that has metadata. Unknown fields pass as-is.
pub fn coerce_row(row: Row, fields: &FieldMap) -> Row {
    row.into_iter()
        .map(|(name, value)| {
            let value = match fields.get(&name) {
                Some(info) => coerce(value, info),
                None => value,
            };
            (name, value)
        })
        .collect()
}

fn to_int(value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => i64::from(*b),
        Value::Int(i) => *i,
        Value::Float(f) => f.trunc() as i64,
        Value::Text(s) => numeric_prefix(s)
            .and_then(|n| n.parse::<f64>().ok())
            .map(|f| f.trunc() as i64)
            .unwrap_or(0),
    }
}

fn to_float(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Text(s) => numeric_prefix(s)
            .and_then(|n| n.parse::<f64>().ok())
            .unwrap_or(0.0),
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Text(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "off"
        ),
    }
}

/// Leading `[+-]digits[.digits]` of a string, if any.
fn numeric_prefix(s: &str) -> Option<&str> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let mut frac = end + 1;
        while frac < bytes.len() && bytes[frac].is_ascii_digit() {
            frac += 1;
        }
        if frac > end + 1 {
            end = frac;
        }
    }
    if end == digits_start {
        None
    } else {
        Some(&s[..end])
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in [DATETIME_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn from_timestamp(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

fn normalize_date(value: &Value) -> String {
    let parsed = match value {
        Value::Int(secs) => from_timestamp(*secs),
        Value::Text(s) => parse_datetime(s),
        _ => None,
    };
    match parsed {
        Some(dt) => dt.format(DATE_FORMAT).to_string(),
        None => value.to_text(),
    }
}

fn normalize_datetime(value: &Value) -> String {
    let parsed = match value {
        Value::Int(secs) => from_timestamp(*secs),
        Value::Text(s) => parse_datetime(s),
        _ => None,
    };
    match parsed {
        Some(dt) => dt.format(DATETIME_FORMAT).to_string(),
        None => value.to_text(),
    }
}

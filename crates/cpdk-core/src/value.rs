//! Scalar field kinds and values.
//!
//! [`FieldKind`] is the closed set of column types an entity field may have;
//! [`FieldValue`] is a value of one of those kinds (or null). Values cross
//! three boundaries: JSON on the wire, SQLite columns in the store, and the
//! registry's declared defaults.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::Serialize;
use serde_json::Value;

/// Scalar kind of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Boolean,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInteger,
    String,
    Float,
}

impl FieldKind {
    /// Parse the schema spelling of a kind. Unsupported spellings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Some(Self::Boolean),
            "integer" | "int" => Some(Self::Integer),
            "biginteger" | "bigint" | "int64" => Some(Self::BigInteger),
            "string" | "str" => Some(Self::String),
            "float" | "real" => Some(Self::Float),
            _ => None,
        }
    }

    /// Column affinity used when laying down tables.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Boolean | Self::Integer | Self::BigInteger => "INTEGER",
            Self::String => "TEXT",
            Self::Float => "REAL",
        }
    }

    /// Convert a wire value to a value of this kind.
    ///
    /// JSON natives are taken as-is when they fit; strings are parsed, since
    /// line-oriented clients send everything as text. `null` clears. Returns
    /// `None` when the value cannot represent this kind.
    pub fn coerce(self, value: &Value) -> Option<FieldValue> {
        if value.is_null() {
            return Some(FieldValue::Null);
        }
        match self {
            Self::Boolean => match value {
                Value::Bool(b) => Some(FieldValue::Bool(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(FieldValue::Bool(false)),
                    Some(1) => Some(FieldValue::Bool(true)),
                    _ => None,
                },
                Value::String(s) => parse_bool(s).map(FieldValue::Bool),
                _ => None,
            },
            Self::Integer => {
                let wide = match value {
                    Value::Number(n) => n.as_i64()?,
                    Value::String(s) => s.trim().parse::<i64>().ok()?,
                    _ => return None,
                };
                i32::try_from(wide).ok().map(|n| FieldValue::Int(i64::from(n)))
            }
            Self::BigInteger => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
                    .map(FieldValue::Int),
                Value::String(s) => s.trim().parse::<i64>().ok().map(FieldValue::Int),
                _ => None,
            },
            // Scalars keep their textual form: a port label of 8080 is "8080".
            Self::String => match value {
                Value::String(s) => Some(FieldValue::Text(s.clone())),
                Value::Number(n) => Some(FieldValue::Text(n.to_string())),
                Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
                _ => None,
            },
            // SQLite stores NaN as NULL, so non-finite values never fit.
            Self::Float => match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|f| f.is_finite())
            .map(FieldValue::Float),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::BigInteger => "biginteger",
            Self::String => "string",
            Self::Float => "float",
        };
        f.write_str(name)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// A stored field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Read a column of the given kind from a result row.
    pub fn read(kind: FieldKind, row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Self> {
        let raw = row.get_ref(idx)?;
        let value = match (kind, raw) {
            (_, ValueRef::Null) => Self::Null,
            (FieldKind::Boolean, ValueRef::Integer(i)) => Self::Bool(i != 0),
            (FieldKind::Integer | FieldKind::BigInteger, ValueRef::Integer(i)) => Self::Int(i),
            (FieldKind::Float, ValueRef::Real(f)) => Self::Float(f),
            (FieldKind::Float, ValueRef::Integer(i)) => Self::Float(i as f64),
            (FieldKind::String, ValueRef::Text(t)) => {
                Self::Text(String::from_utf8_lossy(t).into_owned())
            }
            (_, other) => {
                return Err(rusqlite::Error::InvalidColumnType(
                    idx,
                    kind.to_string(),
                    other.data_type(),
                ));
            }
        };
        Ok(value)
    }

    /// JSON form, as carried in responses and notifications.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqlValue::Null),
            Self::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Self::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Self::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_kinds() {
        assert_eq!(FieldKind::parse("boolean"), Some(FieldKind::Boolean));
        assert_eq!(FieldKind::parse("BigInteger"), Some(FieldKind::BigInteger));
        assert_eq!(FieldKind::parse("float"), Some(FieldKind::Float));
        assert_eq!(FieldKind::parse("decimal"), None);
        assert_eq!(FieldKind::parse(""), None);
    }

    #[test]
    fn test_boolean_coercion() {
        let kind = FieldKind::Boolean;
        assert_eq!(kind.coerce(&json!(true)), Some(FieldValue::Bool(true)));
        assert_eq!(kind.coerce(&json!("False")), Some(FieldValue::Bool(false)));
        assert_eq!(kind.coerce(&json!("on")), Some(FieldValue::Bool(true)));
        assert_eq!(kind.coerce(&json!(0)), Some(FieldValue::Bool(false)));
        assert_eq!(kind.coerce(&json!(2)), None);
        assert_eq!(kind.coerce(&json!("maybe")), None);
    }

    #[test]
    fn test_integer_range_is_32_bit() {
        let kind = FieldKind::Integer;
        assert_eq!(kind.coerce(&json!(1234)), Some(FieldValue::Int(1234)));
        assert_eq!(kind.coerce(&json!("-7")), Some(FieldValue::Int(-7)));
        assert_eq!(kind.coerce(&json!(5_000_000_000i64)), None);
        assert_eq!(kind.coerce(&json!(1.5)), None);
    }

    #[test]
    fn test_biginteger_accepts_wide_values() {
        let kind = FieldKind::BigInteger;
        assert_eq!(
            kind.coerce(&json!(5_000_000_000i64)),
            Some(FieldValue::Int(5_000_000_000))
        );
        assert_eq!(kind.coerce(&json!(u64::MAX)), None);
    }

    #[test]
    fn test_string_keeps_scalar_text() {
        let kind = FieldKind::String;
        assert_eq!(
            kind.coerce(&json!("1.1.1.1")),
            Some(FieldValue::Text("1.1.1.1".to_string()))
        );
        assert_eq!(
            kind.coerce(&json!(8080)),
            Some(FieldValue::Text("8080".to_string()))
        );
        assert_eq!(
            kind.coerce(&json!(true)),
            Some(FieldValue::Text("true".to_string()))
        );
        assert_eq!(kind.coerce(&json!(["a"])), None);
        assert_eq!(kind.coerce(&json!({"a": 1})), None);
    }

    #[test]
    fn test_float_rejects_non_finite() {
        let kind = FieldKind::Float;
        assert_eq!(kind.coerce(&json!("2.5")), Some(FieldValue::Float(2.5)));
        assert_eq!(kind.coerce(&json!(3)), Some(FieldValue::Float(3.0)));
        for text in ["NaN", "nan", "inf", "-inf", "infinity", "1e999"] {
            assert_eq!(kind.coerce(&json!(text)), None, "{text}");
        }
    }

    #[test]
    fn test_null_clears_any_kind() {
        for kind in [FieldKind::Boolean, FieldKind::String, FieldKind::Float] {
            assert_eq!(kind.coerce(&Value::Null), Some(FieldValue::Null));
        }
    }

    #[test]
    fn test_json_forms() {
        assert_eq!(FieldValue::Bool(true).to_json(), json!(true));
        assert_eq!(FieldValue::Int(9).to_json(), json!(9));
        assert_eq!(FieldValue::Null.to_json(), Value::Null);
        assert_eq!(serde_json::to_value(FieldValue::Float(0.5)).unwrap(), json!(0.5));
    }
}

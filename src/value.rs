//! Value types for EmberDB query results.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;

/// A hydrated value from an EmberDB result set.
///
/// Covers every shape the wire-type grammar can describe, including nested
/// arrays and structs. Values the hydrator cannot interpret pass through as
/// [`Value::Json`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed 64-bit integer.
    Int(i64),

    /// 64-bit floating point, including infinities and NaN.
    Float(OrderedFloat<f64>),

    /// Arbitrary-precision numeric. Wide integers and decimals land here so
    /// they are never narrowed to a 53-bit-safe float.
    Decimal(BigDecimal),

    /// Text value.
    Text(String),

    /// Binary buffer decoded from the `\x`-hex wire encoding.
    Bytes(Vec<u8>),

    /// Calendar date without a time component.
    Date(NaiveDate),

    /// Timestamp normalized to UTC, sub-second precision preserved.
    Timestamp(DateTime<Utc>),

    /// Array of values; elements may be `Null` even for non-nullable
    /// element types.
    Array(Vec<Value>),

    /// Struct with declared field-name casing as keys.
    Struct(BTreeMap<String, Value>),

    /// Raw JSON passed through when the wire type could not be hydrated.
    Json(serde_json::Value),
}

impl Value {
    /// Returns the value as a bool if it is a `Bool` variant.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as an i64 if it is an `Int` variant.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as an f64 if it is a `Float` variant.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(f.into_inner()),
            _ => None,
        }
    }

    /// Returns a reference to the decimal if it is a `Decimal` variant.
    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            Value::Decimal(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the value as a string slice if it is a `Text` variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a byte slice if it is a `Bytes` variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a date if it is a `Date` variant.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the value as a UTC timestamp if it is a `Timestamp` variant.
    pub fn as_timestamp(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the elements if it is an `Array` variant.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the fields if it is a `Struct` variant.
    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(m) => Some(m),
            _ => None,
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert raw JSON into an untyped `Value`.
    ///
    /// Used when a column carries a wire type the grammar cannot parse: the
    /// payload still becomes a `Value`, just without type-directed hydration.
    pub fn from_json(raw: &serde_json::Value) -> Value {
        match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(OrderedFloat::from(f))
                } else {
                    Value::Json(raw.clone())
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Json(raw.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<binary {} bytes>", b.len()),
            Value::Date(d) => write!(f, "{}", d),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", name, value)?;
                }
                write!(f, "}}")
            }
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_as_text() {
        let v = Value::Text("hello".to_string());
        assert_eq!(v.as_text(), Some("hello"));

        // Wrong type returns None
        assert_eq!(Value::Int(42).as_text(), None);
        assert_eq!(Value::Null.as_text(), None);
    }

    #[test]
    fn test_as_int() {
        assert_eq!(Value::Int(42).as_int(), Some(42));
        assert_eq!(Value::Int(i64::MIN).as_int(), Some(i64::MIN));

        // Wrong type returns None
        assert_eq!(Value::Float(OrderedFloat::from(42.0)).as_int(), None);
        assert_eq!(Value::Null.as_int(), None);
    }

    #[test]
    fn test_as_float() {
        let v = Value::Float(OrderedFloat::from(2.72));
        assert_eq!(v.as_float(), Some(2.72));
        assert_eq!(Value::Int(1).as_float(), None);
    }

    #[test]
    fn test_as_decimal_keeps_precision() {
        let d = BigDecimal::from_str("12345678901234567890.123456789").unwrap();
        let v = Value::Decimal(d.clone());
        assert_eq!(v.as_decimal(), Some(&d));
        assert_eq!(v.to_string(), "12345678901234567890.123456789");
    }

    #[test]
    fn test_as_bytes() {
        let v = Value::Bytes(vec![0xab, 0xcd]);
        assert_eq!(v.as_bytes(), Some(&[0xab, 0xcd][..]));
        assert!(Value::Text("abcd".to_string()).as_bytes().is_none());
    }

    #[test]
    fn test_is_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Text(String::new()).is_null());
        assert!(!Value::Int(0).is_null());
        assert!(!Value::Bool(false).is_null());
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from_json(&serde_json::json!(true)), Value::Bool(true));
        assert_eq!(Value::from_json(&serde_json::json!(7)), Value::Int(7));
        assert_eq!(
            Value::from_json(&serde_json::json!("x")),
            Value::Text("x".to_string())
        );
    }

    #[test]
    fn test_from_json_nested() {
        let v = Value::from_json(&serde_json::json!([1, "a", null]));
        assert_eq!(
            v,
            Value::Array(vec![
                Value::Int(1),
                Value::Text("a".to_string()),
                Value::Null
            ])
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(-5).to_string(), "-5");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).to_string(), "<binary 3 bytes>");
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "[1,2]"
        );
    }

    #[test]
    fn test_float_equality_includes_nan() {
        // OrderedFloat makes NaN comparable, so rows containing NaN stay Eq-able.
        let a = Value::Float(OrderedFloat::from(f64::NAN));
        let b = Value::Float(OrderedFloat::from(f64::NAN));
        assert_eq!(a, b);
    }
}

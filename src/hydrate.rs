//! Type-directed hydration of raw wire values into [`Value`]s.
//!
//! The backend describes each column with a textual wire type (see
//! [`crate::types::parse_wire_type`]); this module turns the raw JSON payload
//! of a row into native values according to that type, and reshapes rows into
//! the form the caller asked for.

use std::collections::BTreeMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ordered_float::OrderedFloat;

use crate::error::{Error, Result};
use crate::types::{Column, Row, WireType};
use crate::value::Value;

/// Hydrate one raw JSON value according to its wire type.
///
/// A JSON null becomes [`Value::Null`] at any nesting level, even when the
/// declared element or field type is not nullable.
pub fn hydrate_value(raw: &serde_json::Value, ty: &WireType) -> Result<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }

    match ty {
        WireType::Nullable(inner) => hydrate_value(raw, inner),
        WireType::Bool => hydrate_bool(raw),
        WireType::Int => hydrate_int(raw),
        WireType::Float => hydrate_float(raw),
        WireType::Decimal => hydrate_decimal(raw),
        WireType::Text => match raw.as_str() {
            Some(s) => Ok(Value::Text(s.to_string())),
            None => Err(type_mismatch("text", raw)),
        },
        WireType::Bytes => hydrate_bytes(raw),
        WireType::Date => hydrate_date(raw),
        WireType::Timestamp => hydrate_timestamp(raw),
        WireType::TimestampTz => hydrate_timestamptz(raw),
        WireType::Array(elem) => match raw.as_array() {
            Some(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| hydrate_value(item, elem))
                    .collect::<Result<Vec<_>>>()?,
            )),
            None => Err(type_mismatch("array", raw)),
        },
        WireType::Struct(fields) => hydrate_struct(raw, fields),
        // Unparseable wire type: pass the payload through unhydrated.
        WireType::Other(_) => Ok(Value::from_json(raw)),
    }
}

fn type_mismatch(expected: &str, raw: &serde_json::Value) -> Error {
    Error::Parse {
        message: format!("expected {} value, got {}", expected, raw),
    }
}

fn hydrate_bool(raw: &serde_json::Value) -> Result<Value> {
    match raw {
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(type_mismatch("boolean", raw)),
        },
        serde_json::Value::String(s) if s == "true" => Ok(Value::Bool(true)),
        serde_json::Value::String(s) if s == "false" => Ok(Value::Bool(false)),
        _ => Err(type_mismatch("boolean", raw)),
    }
}

fn hydrate_int(raw: &serde_json::Value) -> Result<Value> {
    match raw {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                // Wider than i64: keep full precision instead of narrowing.
                BigDecimal::from_str(&n.to_string())
                    .map(Value::Decimal)
                    .map_err(|_| type_mismatch("integer", raw))
            }
        }
        serde_json::Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Ok(Value::Int(i))
            } else {
                BigDecimal::from_str(s)
                    .map(Value::Decimal)
                    .map_err(|_| type_mismatch("integer", raw))
            }
        }
        _ => Err(type_mismatch("integer", raw)),
    }
}

fn hydrate_float(raw: &serde_json::Value) -> Result<Value> {
    match raw {
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => Ok(Value::Float(OrderedFloat::from(f))),
            None => Err(type_mismatch("float", raw)),
        },
        // Infinities and NaN cannot be JSON numbers; the backend sends these
        // exact tokens instead. Case-sensitive.
        serde_json::Value::String(s) => match s.as_str() {
            "inf" => Ok(Value::Float(OrderedFloat::from(f64::INFINITY))),
            "-inf" => Ok(Value::Float(OrderedFloat::from(f64::NEG_INFINITY))),
            "nan" => Ok(Value::Float(OrderedFloat::from(f64::NAN))),
            "-nan" => Ok(Value::Float(OrderedFloat::from(-f64::NAN))),
            _ => Err(type_mismatch("float", raw)),
        },
        _ => Err(type_mismatch("float", raw)),
    }
}

fn hydrate_decimal(raw: &serde_json::Value) -> Result<Value> {
    let text = match raw {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return Err(type_mismatch("decimal", raw)),
    };
    BigDecimal::from_str(&text)
        .map(Value::Decimal)
        .map_err(|_| type_mismatch("decimal", raw))
}

/// Decode the `\x`-prefixed hex wire encoding of bytea.
fn hydrate_bytes(raw: &serde_json::Value) -> Result<Value> {
    let s = raw.as_str().ok_or_else(|| type_mismatch("bytea", raw))?;
    let hex = s
        .strip_prefix("\\x")
        .ok_or_else(|| type_mismatch("bytea", raw))?;
    // Non-ASCII payloads are corrupt; slicing them by byte index would panic.
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(type_mismatch("bytea", raw));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| type_mismatch("bytea", raw))?;
        bytes.push(byte);
    }
    Ok(Value::Bytes(bytes))
}

fn hydrate_date(raw: &serde_json::Value) -> Result<Value> {
    let s = raw.as_str().ok_or_else(|| type_mismatch("date", raw))?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|e| Error::Parse {
            message: format!("invalid date '{}': {}", s, e),
        })
}

fn hydrate_timestamp(raw: &serde_json::Value) -> Result<Value> {
    let s = raw.as_str().ok_or_else(|| type_mismatch("timestamp", raw))?;
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Value::Timestamp(t.and_utc()));
        }
    }
    Err(Error::Parse {
        message: format!("invalid timestamp '{}'", s),
    })
}

/// `timestamptz` carries an offset on the wire; the hydrated value is
/// normalized to UTC.
fn hydrate_timestamptz(raw: &serde_json::Value) -> Result<Value> {
    let s = raw.as_str().ok_or_else(|| type_mismatch("timestamptz", raw))?;
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(Value::Timestamp(t.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(t) = DateTime::parse_from_str(s, format) {
            return Ok(Value::Timestamp(t.with_timezone(&Utc)));
        }
    }
    Err(Error::Parse {
        message: format!("invalid timestamptz '{}'", s),
    })
}

fn hydrate_struct(raw: &serde_json::Value, fields: &[(String, WireType)]) -> Result<Value> {
    let obj = raw
        .as_object()
        .ok_or_else(|| type_mismatch("struct", raw))?;
    let mut out = BTreeMap::new();
    for (declared_name, field_ty) in fields {
        // Payload lookup is case-insensitive; the declared casing wins in
        // the hydrated output.
        let payload = obj.get(declared_name).or_else(|| {
            obj.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(declared_name))
                .map(|(_, v)| v)
        });
        let value = match payload {
            Some(v) => hydrate_value(v, field_ty)?,
            None => Value::Null,
        };
        out.insert(declared_name.clone(), value);
    }
    Ok(Value::Struct(out))
}

/// Per-query row decoder: wire types parsed once, applied per row.
pub struct RowHydrator {
    columns: Vec<Column>,
    types: Vec<WireType>,
    normalize: bool,
    big_number_as_string: bool,
}

impl RowHydrator {
    /// Build a decoder for one query's column set.
    pub fn new(columns: &[Column], normalize: bool, big_number_as_string: bool) -> Self {
        let types = columns.iter().map(Column::wire_type).collect();
        Self {
            columns: columns.to_vec(),
            types,
            normalize,
            big_number_as_string,
        }
    }

    /// Column metadata this decoder was built for.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Hydrate one raw positional row into the caller-selected shape.
    pub fn decode(&self, raw: &[serde_json::Value]) -> Result<Row> {
        if raw.len() != self.columns.len() {
            return Err(Error::Parse {
                message: format!(
                    "row has {} values but {} columns were declared",
                    raw.len(),
                    self.columns.len()
                ),
            });
        }
        let mut values = Vec::with_capacity(raw.len());
        for (cell, ty) in raw.iter().zip(&self.types) {
            let mut value = hydrate_value(cell, ty)?;
            if self.big_number_as_string {
                value = decimal_to_text(value);
            }
            values.push(value);
        }
        if self.normalize {
            // Column order drives insertion, so duplicate names resolve
            // "later wins".
            let mut map = BTreeMap::new();
            for (column, value) in self.columns.iter().zip(values) {
                map.insert(column.name.clone(), value);
            }
            Ok(Row::Mapped(map))
        } else {
            Ok(Row::Positional(values))
        }
    }
}

/// Recursively render decimals as text (the `big_number_as_string` option).
fn decimal_to_text(value: Value) -> Value {
    match value {
        Value::Decimal(d) => Value::Text(d.to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(decimal_to_text).collect()),
        Value::Struct(fields) => Value::Struct(
            fields
                .into_iter()
                .map(|(k, v)| (k, decimal_to_text(v)))
                .collect(),
        ),
        other => other,
    }
}

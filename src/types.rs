//! Core types for EmberDB query results: the wire-type grammar, column
//! metadata, rows and the buffered result document.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::value::Value;

/// Parsed form of the backend's textual wire-type grammar.
///
/// The grammar is recursive: `nullable(T)` (or a trailing ` null`),
/// `array(T)`, `struct(name T, ...)` with bare or backtick-quoted field
/// names, and scalar leaves. Anything the parser cannot interpret becomes
/// [`WireType::Other`] and hydrates as pass-through JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum WireType {
    /// Boolean.
    Bool,
    /// Signed integer up to 64 bits.
    Int,
    /// Floating point (float/real/double).
    Float,
    /// Arbitrary-precision decimal/numeric.
    Decimal,
    /// Text/string/varchar.
    Text,
    /// Binary (`bytea`).
    Bytes,
    /// Calendar date.
    Date,
    /// Timestamp without time zone, interpreted as UTC.
    Timestamp,
    /// Timestamp with embedded offset, normalized to UTC.
    TimestampTz,
    /// Wrapper admitting NULL.
    Nullable(Box<WireType>),
    /// Array of an element type.
    Array(Box<WireType>),
    /// Struct with declared field names in declaration order.
    Struct(Vec<(String, WireType)>),
    /// Unrecognized or malformed type string, kept verbatim.
    Other(String),
}

/// Parse one wire-type string into a [`WireType`].
///
/// Malformed grammar (unterminated parentheses, unclosed backticks) is not an
/// error: it yields `WireType::Other` so the value passes through unhydrated.
pub fn parse_wire_type(input: &str) -> WireType {
    let s = input.trim();

    if let Some(prefix) = s.strip_suffix(" null") {
        return WireType::Nullable(Box::new(parse_wire_type(prefix)));
    }
    if let Some(inner) = strip_wrapper(s, "nullable(") {
        return WireType::Nullable(Box::new(parse_wire_type(inner)));
    }
    if let Some(inner) = strip_wrapper(s, "array(") {
        return WireType::Array(Box::new(parse_wire_type(inner)));
    }
    if s.starts_with("struct(") {
        return match strip_wrapper(s, "struct(").and_then(parse_struct_fields) {
            Some(fields) => WireType::Struct(fields),
            None => WireType::Other(s.to_string()),
        };
    }

    // Scalars may carry precision args, e.g. decimal(38, 9).
    let base = s.split('(').next().unwrap_or(s).trim();
    match base.to_ascii_lowercase().as_str() {
        "boolean" | "bool" => WireType::Bool,
        "int" | "integer" | "bigint" | "long" => WireType::Int,
        "float" | "real" | "double" | "double precision" | "float4" | "float8" => WireType::Float,
        "decimal" | "numeric" => WireType::Decimal,
        "text" | "string" | "varchar" => WireType::Text,
        "bytea" => WireType::Bytes,
        "date" | "pgdate" => WireType::Date,
        "timestamp" | "timestampntz" | "datetime" => WireType::Timestamp,
        "timestamptz" => WireType::TimestampTz,
        _ => WireType::Other(s.to_string()),
    }
}

/// Strip `prefix` and a matching trailing `)`; None when unterminated.
fn strip_wrapper<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.strip_prefix(prefix)?.strip_suffix(')')
}

fn parse_struct_fields(inner: &str) -> Option<Vec<(String, WireType)>> {
    let mut fields = Vec::new();
    for part in split_top_level(inner)? {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, ty) = if let Some(rest) = part.strip_prefix('`') {
            // Backtick-quoted names may contain spaces, punctuation, any case.
            let end = rest.find('`')?;
            (rest[..end].to_string(), rest[end + 1..].trim())
        } else {
            let sp = part.find(' ')?;
            (part[..sp].to_string(), part[sp + 1..].trim())
        };
        if ty.is_empty() {
            return None;
        }
        fields.push((name, parse_wire_type(ty)));
    }
    Some(fields)
}

/// Split on commas at paren depth zero, outside backticks.
fn split_top_level(s: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_ticks = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '`' => in_ticks = !in_ticks,
            '(' if !in_ticks => depth += 1,
            ')' if !in_ticks => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
            }
            ',' if !in_ticks && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || in_ticks {
        return None;
    }
    parts.push(&s[start..]);
    Some(parts)
}

/// Column metadata as it appears on the wire.
///
/// Immutable once produced for a query: a query's column list never changes
/// after first emission.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Wire-type string, e.g. `nullable(array(int))`.
    pub r#type: String,
}

impl Column {
    /// Parse this column's wire-type string.
    pub fn wire_type(&self) -> WireType {
        parse_wire_type(&self.r#type)
    }
}

/// One result row, in the shape the caller selected.
#[derive(Clone, Debug, PartialEq)]
pub enum Row {
    /// Ordered values aligned to column order. Preserves every value even
    /// when column names collide.
    Positional(Vec<Value>),
    /// Name-to-value mapping; with duplicate column names the later column
    /// wins.
    Mapped(BTreeMap<String, Value>),
}

impl Row {
    /// Value at a positional index, if this is a positional row.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Row::Positional(values) => values.get(index),
            Row::Mapped(_) => None,
        }
    }

    /// Value under a column name, if this is a mapped row.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        match self {
            Row::Positional(_) => None,
            Row::Mapped(map) => map.get(name),
        }
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        match self {
            Row::Positional(values) => values.len(),
            Row::Mapped(map) => map.len(),
        }
    }

    /// True when the row carries no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execution statistics from a buffered response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Statistics {
    /// Wall-clock seconds spent executing.
    pub elapsed: Option<f64>,
    /// Rows scanned by the engine.
    pub rows_read: Option<u64>,
    /// Bytes scanned by the engine.
    pub bytes_read: Option<u64>,
    /// Seconds between submission and execution start.
    pub time_before_execution: Option<f64>,
    /// Seconds spent in execution proper.
    pub time_to_execute: Option<f64>,
    /// Any further statistics keys the backend adds.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A complete buffered query result: metadata, hydrated rows, statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    /// Column metadata in declaration order.
    pub meta: Vec<Column>,
    /// Hydrated rows.
    pub data: Vec<Row>,
    /// Execution statistics, when the backend sent them.
    pub statistics: Option<Statistics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse_wire_type("int"), WireType::Int);
        assert_eq!(parse_wire_type("bigint"), WireType::Int);
        assert_eq!(parse_wire_type("text"), WireType::Text);
        assert_eq!(parse_wire_type("double"), WireType::Float);
        assert_eq!(parse_wire_type("boolean"), WireType::Bool);
        assert_eq!(parse_wire_type("bytea"), WireType::Bytes);
        assert_eq!(parse_wire_type("date"), WireType::Date);
        assert_eq!(parse_wire_type("timestampntz"), WireType::Timestamp);
        assert_eq!(parse_wire_type("timestamptz"), WireType::TimestampTz);
    }

    #[test]
    fn test_parse_decimal_with_precision() {
        assert_eq!(parse_wire_type("decimal(38, 9)"), WireType::Decimal);
        assert_eq!(parse_wire_type("numeric(20,0)"), WireType::Decimal);
    }

    #[test]
    fn test_parse_nullable_forms() {
        assert_eq!(
            parse_wire_type("nullable(int)"),
            WireType::Nullable(Box::new(WireType::Int))
        );
        assert_eq!(
            parse_wire_type("text null"),
            WireType::Nullable(Box::new(WireType::Text))
        );
    }

    #[test]
    fn test_parse_nested_array() {
        assert_eq!(
            parse_wire_type("array(array(nullable(int)))"),
            WireType::Array(Box::new(WireType::Array(Box::new(WireType::Nullable(
                Box::new(WireType::Int)
            )))))
        );
    }

    #[test]
    fn test_parse_struct() {
        assert_eq!(
            parse_wire_type("struct(id int, name text)"),
            WireType::Struct(vec![
                ("id".to_string(), WireType::Int),
                ("name".to_string(), WireType::Text),
            ])
        );
    }

    #[test]
    fn test_parse_struct_backtick_names() {
        assert_eq!(
            parse_wire_type("struct(`Weird Name!` text, plain int)"),
            WireType::Struct(vec![
                ("Weird Name!".to_string(), WireType::Text),
                ("plain".to_string(), WireType::Int),
            ])
        );
    }

    #[test]
    fn test_parse_struct_nested() {
        assert_eq!(
            parse_wire_type("struct(inner struct(a int, b text), tags array(text))"),
            WireType::Struct(vec![
                (
                    "inner".to_string(),
                    WireType::Struct(vec![
                        ("a".to_string(), WireType::Int),
                        ("b".to_string(), WireType::Text),
                    ])
                ),
                ("tags".to_string(), WireType::Array(Box::new(WireType::Text))),
            ])
        );
    }

    #[test]
    fn test_malformed_struct_is_other_not_error() {
        // Unterminated parens: value must pass through unhydrated.
        assert_eq!(
            parse_wire_type("struct(a int"),
            WireType::Other("struct(a int".to_string())
        );
        assert_eq!(
            parse_wire_type("struct(a int, b struct(c int)"),
            WireType::Other("struct(a int, b struct(c int)".to_string())
        );
    }

    #[test]
    fn test_unknown_type_is_other() {
        assert_eq!(
            parse_wire_type("geography"),
            WireType::Other("geography".to_string())
        );
    }

    #[test]
    fn test_column_wire_type() {
        let col = Column {
            name: "ids".to_string(),
            r#type: "array(int)".to_string(),
        };
        assert_eq!(col.wire_type(), WireType::Array(Box::new(WireType::Int)));
    }

    #[test]
    fn test_statistics_deserialize_with_extras() {
        let stats: Statistics = serde_json::from_str(
            r#"{"elapsed": 0.1, "rows_read": 3, "bytes_read": 42, "scanned_bytes_cache": 7}"#,
        )
        .unwrap();
        assert_eq!(stats.elapsed, Some(0.1));
        assert_eq!(stats.rows_read, Some(3));
        assert_eq!(stats.extra.get("scanned_bytes_cache").and_then(|v| v.as_u64()), Some(7));
    }
}

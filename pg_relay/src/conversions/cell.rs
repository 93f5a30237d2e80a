use std::{
    num::{ParseFloatError, ParseIntError},
    str::{from_utf8, ParseBoolError, Utf8Error},
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_protocol::message::backend::TupleData;
use thiserror::Error;
use tokio_postgres::types::{Kind, Type};

use crate::error::{Classify, ErrorKind};

/// Canonical value of a single column. The wire hands us the source's text
/// representation; decoding is driven by the column's declared type oid.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Raw bytes plus the type oid. Used for bytea and for any oid the
    /// decoder does not know, so downstream stages can decide policy.
    Bytes { oid: u32, data: Vec<u8> },
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Hstore(Vec<(String, Option<String>)>),
    Array(Vec<CellValue>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Rough in-memory weight, used by the batch queue byte accounting.
    pub fn size_bytes(&self) -> usize {
        match self {
            CellValue::Null | CellValue::Bool(_) => 1,
            CellValue::Int(_) | CellValue::Float(_) => 8,
            CellValue::String(s) => s.len(),
            CellValue::Bytes { data, .. } => data.len(),
            CellValue::Timestamp(_) => 16,
            CellValue::Json(v) => v.to_string().len(),
            CellValue::Hstore(pairs) => pairs
                .iter()
                .map(|(k, v)| k.len() + v.as_ref().map_or(0, |v| v.len()))
                .sum(),
            CellValue::Array(items) => items.iter().map(CellValue::size_bytes).sum(),
        }
    }

    /// Canonical JSON representation, used by the kafka and webhook sinks.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Int(i) => serde_json::Value::Number((*i).into()),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::String(s) => serde_json::Value::String(s.clone()),
            CellValue::Bytes { data, .. } => {
                // Postgres hex format, e.g. \x68656c6c6f.
                let mut out = String::with_capacity(2 + data.len() * 2);
                out.push_str("\\x");
                for b in data {
                    out.push_str(&format!("{b:02x}"));
                }
                serde_json::Value::String(out)
            }
            CellValue::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            CellValue::Json(v) => v.clone(),
            CellValue::Hstore(pairs) => serde_json::Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            v.as_ref()
                                .map(|v| serde_json::Value::String(v.clone()))
                                .unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect(),
            ),
            CellValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(CellValue::to_json).collect())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CellDecodeError {
    #[error("unchanged toast not supported")]
    UnchangedToastNotSupported,

    #[error("invalid string value")]
    InvalidStr(#[from] Utf8Error),

    #[error("invalid bool value")]
    InvalidBool(#[from] ParseBoolError),

    #[error("invalid int value")]
    InvalidInt(#[from] ParseIntError),

    #[error("invalid float value")]
    InvalidFloat(#[from] ParseFloatError),

    #[error("invalid timestamp value")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("invalid json value: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("malformed bytea value")]
    MalformedBytea,

    #[error("malformed array value: {0}")]
    MalformedArray(String),

    #[error("malformed hstore value: {0}")]
    MalformedHstore(String),
}

// A record that fails to decode means the WAL contents and the relation
// metadata disagree. There is no safe way to continue past it.
impl Classify for CellDecodeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Decodes text-format tuple data into [`CellValue`]s.
///
/// hstore is an extension type whose oid differs per database, so the
/// decoder is handed the oid discovered at connection time.
#[derive(Debug, Clone, Default)]
pub struct CellDecoder {
    hstore_oid: Option<u32>,
}

impl CellDecoder {
    pub fn new(hstore_oid: Option<u32>) -> Self {
        Self { hstore_oid }
    }

    pub fn decode(&self, type_id: u32, val: &TupleData) -> Result<CellValue, CellDecodeError> {
        let bytes = match val {
            TupleData::Null => return Ok(CellValue::Null),
            TupleData::UnchangedToast => {
                return Err(CellDecodeError::UnchangedToastNotSupported);
            }
            TupleData::Text(bytes) => &bytes[..],
        };
        self.decode_text(type_id, bytes)
    }

    pub fn decode_text(&self, type_id: u32, bytes: &[u8]) -> Result<CellValue, CellDecodeError> {
        if Some(type_id) == self.hstore_oid {
            return parse_hstore(from_utf8(bytes)?);
        }

        let Some(typ) = Type::from_oid(type_id) else {
            return Ok(CellValue::Bytes {
                oid: type_id,
                data: bytes.to_vec(),
            });
        };

        if let Kind::Array(element) = typ.kind() {
            let element = element.clone();
            return parse_array(from_utf8(bytes)?, |text| {
                self.decode_text(element.oid(), text.as_bytes())
            });
        }

        match typ {
            Type::BOOL => {
                let val = from_utf8(bytes)?;
                let parsed = match val {
                    "t" => true,
                    "f" => false,
                    other => other.parse()?,
                };
                Ok(CellValue::Bool(parsed))
            }
            Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => {
                Ok(CellValue::Int(from_utf8(bytes)?.parse()?))
            }
            Type::FLOAT4 | Type::FLOAT8 => Ok(CellValue::Float(from_utf8(bytes)?.parse()?)),
            Type::TIMESTAMP => {
                let naive =
                    NaiveDateTime::parse_from_str(from_utf8(bytes)?, "%Y-%m-%d %H:%M:%S%.f")?;
                Ok(CellValue::Timestamp(naive.and_utc()))
            }
            Type::TIMESTAMPTZ => {
                let ts =
                    DateTime::parse_from_str(from_utf8(bytes)?, "%Y-%m-%d %H:%M:%S%.f%#z")?;
                Ok(CellValue::Timestamp(ts.with_timezone(&Utc)))
            }
            Type::DATE => {
                let date = NaiveDate::parse_from_str(from_utf8(bytes)?, "%Y-%m-%d")?;
                Ok(CellValue::Timestamp(
                    date.and_time(NaiveTime::MIN).and_utc(),
                ))
            }
            Type::JSON | Type::JSONB => Ok(CellValue::Json(serde_json::from_slice(bytes)?)),
            Type::BYTEA => parse_bytea(from_utf8(bytes)?),
            // Numeric keeps its exact text representation.
            Type::NUMERIC
            | Type::CHAR
            | Type::BPCHAR
            | Type::VARCHAR
            | Type::NAME
            | Type::TEXT
            | Type::UUID
            | Type::TIME
            | Type::INTERVAL => Ok(CellValue::String(from_utf8(bytes)?.to_string())),
            other => Ok(CellValue::Bytes {
                oid: other.oid(),
                data: bytes.to_vec(),
            }),
        }
    }
}

fn parse_bytea(text: &str) -> Result<CellValue, CellDecodeError> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or(CellDecodeError::MalformedBytea)?;
    if hex.len() % 2 != 0 {
        return Err(CellDecodeError::MalformedBytea);
    }
    let mut data = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte =
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| CellDecodeError::MalformedBytea)?;
        data.push(byte);
    }
    Ok(CellValue::Bytes { oid: 17, data })
}

/// Parses the `{a,b,NULL,"c,d"}` text representation of an array, decoding
/// each element with the provided function.
fn parse_array<F>(text: &str, decode_element: F) -> Result<CellValue, CellDecodeError>
where
    F: Fn(&str) -> Result<CellValue, CellDecodeError>,
{
    let inner = text
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| CellDecodeError::MalformedArray(text.to_string()))?;

    if inner.is_empty() {
        return Ok(CellValue::Array(vec![]));
    }

    let mut items = vec![];
    for element in split_array_elements(inner, text)? {
        match element {
            ArrayElement::Null => items.push(CellValue::Null),
            ArrayElement::Literal(s) => items.push(decode_element(&s)?),
        }
    }
    Ok(CellValue::Array(items))
}

enum ArrayElement {
    Null,
    Literal(String),
}

fn split_array_elements(inner: &str, full: &str) -> Result<Vec<ArrayElement>, CellDecodeError> {
    let mut elements = vec![];
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            '\\' if quoted => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| CellDecodeError::MalformedArray(full.to_string()))?;
                current.push(escaped);
            }
            ',' if !quoted => {
                elements.push(finish_element(std::mem::take(&mut current), was_quoted));
                was_quoted = false;
            }
            c => current.push(c),
        }
    }
    if quoted {
        return Err(CellDecodeError::MalformedArray(full.to_string()));
    }
    elements.push(finish_element(current, was_quoted));
    Ok(elements)
}

fn finish_element(raw: String, was_quoted: bool) -> ArrayElement {
    if !was_quoted && raw == "NULL" {
        ArrayElement::Null
    } else {
        ArrayElement::Literal(raw)
    }
}

/// Parses the `"k"=>"v", "k2"=>NULL` text representation of an hstore.
fn parse_hstore(text: &str) -> Result<CellValue, CellDecodeError> {
    let mut pairs = vec![];
    let mut rest = text.trim();

    while !rest.is_empty() {
        let (key, after_key) = take_hstore_string(rest, text)?;
        let after_key = after_key.trim_start();
        let after_arrow = after_key
            .strip_prefix("=>")
            .ok_or_else(|| CellDecodeError::MalformedHstore(text.to_string()))?
            .trim_start();

        let (value, after_value) = if let Some(after_null) = after_arrow.strip_prefix("NULL") {
            (None, after_null)
        } else {
            let (value, after_value) = take_hstore_string(after_arrow, text)?;
            (Some(value), after_value)
        };
        pairs.push((key, value));

        rest = after_value.trim_start();
        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma.trim_start();
        } else if !rest.is_empty() {
            return Err(CellDecodeError::MalformedHstore(text.to_string()));
        }
    }

    Ok(CellValue::Hstore(pairs))
}

fn take_hstore_string<'a>(
    input: &'a str,
    full: &str,
) -> Result<(String, &'a str), CellDecodeError> {
    let rest = input
        .strip_prefix('"')
        .ok_or_else(|| CellDecodeError::MalformedHstore(full.to_string()))?;

    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| CellDecodeError::MalformedHstore(full.to_string()))?;
                out.push(escaped);
            }
            '"' => return Ok((out, &rest[i + 1..])),
            c => out.push(c),
        }
    }
    Err(CellDecodeError::MalformedHstore(full.to_string()))
}

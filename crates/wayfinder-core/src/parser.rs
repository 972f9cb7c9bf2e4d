//! Raw records and the payload parsers that produce them.
//!
//! A [`RecordParser`] turns one fetched payload into raw records. The
//! outer `Result` fails the whole payload; each inner `Result` is one
//! record, so a single malformed row never aborts the batch.

use serde_json::{Map, Value};

use crate::error::AppError;

/// One untyped record as it came out of a source payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build from `(key, value)` string pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// First alias whose value is present and non-empty.
    pub fn value<S: AsRef<str>>(&self, aliases: &[S]) -> Option<&Value> {
        aliases
            .iter()
            .filter_map(|a| self.0.get(a.as_ref()))
            .find(|v| !is_empty(v))
    }

    /// Like [`value`](Self::value), rendered as trimmed text.
    pub fn field<S: AsRef<str>>(&self, aliases: &[S]) -> Option<String> {
        self.value(aliases)
            .map(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// All values concatenated and lowercased, for keyword detection.
    pub fn text(&self) -> String {
        self.0
            .values()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Turns a fetched payload into raw records.
pub trait RecordParser: Send + Sync {
    fn parse(&self, body: &str) -> Result<Vec<Result<RawRecord, AppError>>, AppError>;
}

/// CSV with a header row. Headers are normalised to snake_case.
#[derive(Debug, Clone, Default)]
pub struct CsvParser;

impl RecordParser for CsvParser {
    fn parse(&self, body: &str) -> Result<Vec<Result<RawRecord, AppError>>, AppError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());
        let headers: Vec<String> = reader.headers()?.iter().map(snake_case).collect();

        Ok(reader
            .records()
            .map(|row| {
                let row = row?;
                Ok(RawRecord(
                    headers
                        .iter()
                        .zip(row.iter())
                        .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
                        .collect(),
                ))
            })
            .collect())
    }
}

/// JSON payload. `records_pointer` is a JSON pointer to the records array
/// (e.g. `/result/records`); empty means the document itself.
#[derive(Debug, Clone, Default)]
pub struct JsonParser {
    records_pointer: String,
}

impl JsonParser {
    pub fn new(records_pointer: impl Into<String>) -> Self {
        Self {
            records_pointer: records_pointer.into(),
        }
    }
}

impl RecordParser for JsonParser {
    fn parse(&self, body: &str) -> Result<Vec<Result<RawRecord, AppError>>, AppError> {
        let doc: Value = serde_json::from_str(body)
            .map_err(|e| AppError::ParseError(format!("invalid JSON payload: {e}")))?;

        let target = if self.records_pointer.is_empty() {
            &doc
        } else {
            doc.pointer(&self.records_pointer).ok_or_else(|| {
                AppError::ParseError(format!(
                    "JSON pointer {} not found in payload",
                    self.records_pointer
                ))
            })?
        };

        match target {
            Value::Array(items) => Ok(items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(map) => Ok(RawRecord(map.clone())),
                    other => Err(AppError::ParseError(format!(
                        "record {i} is not an object: {other}"
                    ))),
                })
                .collect()),
            Value::Object(map) => Ok(vec![Ok(RawRecord(map.clone()))]),
            other => Err(AppError::ParseError(format!(
                "expected an array of records, found {}",
                json_kind(other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `"Service Name"` → `"service_name"`, `"Post-Code"` → `"post_code"`.
pub fn snake_case(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut prev_underscore = true;
    for c in header.trim().trim_start_matches('\u{feff}').chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

//! Raw, unvalidated input records as supplied by whatever collected them.
//!
//! A record maps feature names to scalars. On disk it is either a TOML table of
//! `name = value` pairs or a two-column tab-separated file (`feature<TAB>value`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// A raw scalar: either a number or free text (a category label, or digits typed
/// into a text field). The schema decides what is admissible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(value) => write!(f, "{value}"),
            RawValue::Text(text) => write!(f, "{text}"),
        }
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value as f64)
    }
}

impl From<&str> for RawValue {
    fn from(text: &str) -> Self {
        RawValue::Text(text.to_string())
    }
}

/// Feature name to raw value. Ordered so that serialized records are stable.
pub type RawRecord = BTreeMap<String, RawValue>;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to read input record: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML input record: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize input record to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Failed to parse tab-separated input record: {0}")]
    Tsv(#[from] csv::Error),
    #[error("Line {line} of the tab-separated record must have exactly two columns, found {found}.")]
    MalformedRow { line: u64, found: usize },
    #[error("Feature '{0}' appears more than once in the input record.")]
    DuplicateKey(String),
}

/// Loads a record, choosing the format by extension: `.tsv`/`.txt` are tab-separated,
/// everything else is TOML.
pub fn load_record(path: impl AsRef<Path>) -> Result<RawRecord, RecordError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let is_tabular = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("txt"));
    if is_tabular {
        parse_tsv_record(&text)
    } else {
        parse_toml_record(&text)
    }
}

pub fn parse_toml_record(text: &str) -> Result<RawRecord, RecordError> {
    Ok(toml::from_str(text)?)
}

pub fn to_toml_string(record: &RawRecord) -> Result<String, RecordError> {
    Ok(toml::to_string(record)?)
}

/// Parses `feature<TAB>value` rows. A first row of `feature<TAB>value` is treated as
/// a header. Values are kept as text; numeric interpretation belongs to the schema.
pub fn parse_tsv_record(text: &str) -> Result<RawRecord, RecordError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());

    let mut record = RawRecord::new();
    for (row_index, row) in reader.records().enumerate() {
        let row = row?;
        let line = row.position().map_or(row_index as u64 + 1, |p| p.line());
        if row.len() != 2 {
            return Err(RecordError::MalformedRow {
                line,
                found: row.len(),
            });
        }
        let name = row[0].trim();
        let value = row[1].trim();
        if row_index == 0
            && name.eq_ignore_ascii_case("feature")
            && value.eq_ignore_ascii_case("value")
        {
            continue;
        }
        if record
            .insert(name.to_string(), RawValue::Text(value.to_string()))
            .is_some()
        {
            return Err(RecordError::DuplicateKey(name.to_string()));
        }
    }
    Ok(record)
}

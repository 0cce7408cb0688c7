//! Canonical record model shared by the fetch, reconcile and persistence layers.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "isync-core";

/// Stored for people fields (assignee, reporter) the source left empty.
pub const UNASSIGNED: &str = "unassigned";

/// One raw source record: a decoded JSON object or a transcribed CSV row.
pub type RawRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Timestamp,
    Number,
    Json,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Timestamp => "TIMESTAMPTZ",
            ColumnKind::Number => "DOUBLE PRECISION",
            ColumnKind::Json => "JSONB",
        }
    }
}

/// Typed value of one canonical field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Text(String),
    Timestamp(DateTime<Utc>),
    Number(f64),
    Json(JsonValue),
}

static NULL_CELL: CellValue = CellValue::Null;

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Scalar JSON maps onto the matching cell; blank strings become `Null`,
    /// arrays and objects are kept as `Json`.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => CellValue::Null,
            JsonValue::String(s) if s.trim().is_empty() => CellValue::Null,
            JsonValue::String(s) => CellValue::Text(s.clone()),
            JsonValue::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Null),
            JsonValue::Bool(b) => CellValue::Text(b.to_string()),
            other => CellValue::Json(other.clone()),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self.clone().coerce(ColumnKind::Text) {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.clone().coerce(ColumnKind::Timestamp) {
            CellValue::Timestamp(ts) => Some(ts),
            _ => None,
        }
    }

    /// Convert to the representation a column of `kind` stores. Values that
    /// cannot be represented become `Null`; this never fails.
    pub fn coerce(self, kind: ColumnKind) -> CellValue {
        match (kind, self) {
            (_, CellValue::Null) => CellValue::Null,

            (ColumnKind::Text, CellValue::Text(s)) => CellValue::Text(s),
            (ColumnKind::Text, CellValue::Timestamp(ts)) => CellValue::Text(ts.to_rfc3339()),
            (ColumnKind::Text, CellValue::Number(n)) => CellValue::Text(format_number(n)),
            (ColumnKind::Text, CellValue::Json(JsonValue::String(s))) => CellValue::Text(s),
            (ColumnKind::Text, CellValue::Json(v)) => CellValue::Text(v.to_string()),

            (ColumnKind::Timestamp, CellValue::Timestamp(ts)) => CellValue::Timestamp(ts),
            (ColumnKind::Timestamp, CellValue::Text(s)) => {
                parse_timestamp(&s).map(CellValue::Timestamp).unwrap_or(CellValue::Null)
            }
            (ColumnKind::Timestamp, CellValue::Number(n)) => {
                timestamp_from_epoch(n).map(CellValue::Timestamp).unwrap_or(CellValue::Null)
            }
            (ColumnKind::Timestamp, CellValue::Json(_)) => CellValue::Null,

            (ColumnKind::Number, CellValue::Number(n)) => CellValue::Number(n),
            (ColumnKind::Number, CellValue::Text(s)) => parse_number(&s)
                .map(CellValue::Number)
                .unwrap_or(CellValue::Null),
            (ColumnKind::Number, CellValue::Timestamp(_)) => CellValue::Null,
            (ColumnKind::Number, CellValue::Json(v)) => {
                v.as_f64().map(CellValue::Number).unwrap_or(CellValue::Null)
            }

            (ColumnKind::Json, CellValue::Json(v)) => CellValue::Json(v),
            (ColumnKind::Json, CellValue::Text(s)) => CellValue::Json(JsonValue::String(s)),
            (ColumnKind::Json, CellValue::Timestamp(ts)) => {
                CellValue::Json(JsonValue::String(ts.to_rfc3339()))
            }
            (ColumnKind::Json, CellValue::Number(n)) => serde_json::Number::from_f64(n)
                .map(|n| CellValue::Json(JsonValue::Number(n)))
                .unwrap_or(CellValue::Null),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            CellValue::Null => JsonValue::Null,
            CellValue::Text(s) => JsonValue::String(s.clone()),
            CellValue::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            CellValue::Json(v) => v.clone(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn parse_number(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .parse::<f64>()
        .ok()
        .or_else(|| trimmed.replace(',', ".").parse::<f64>().ok())
        .filter(|n| n.is_finite())
}

/// Epoch numbers above 1e11 are read as milliseconds, smaller ones as seconds.
pub fn timestamp_from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() >= 1e11 {
        value as i64
    } else {
        (value * 1000.0) as i64
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse the timestamp shapes the sources emit: RFC 3339, Jira's
/// `2024-05-02T10:11:12.345-0300`, plain `YYYY-MM-DD[ HH:MM[:SS]]` and
/// day-first `DD/MM/YYYY[ HH:MM[:SS]]`. Naive values are taken as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    const NAIVE_DATETIME_FORMATS: [&str; 6] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%Y/%m/%d %H:%M:%S",
    ];
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Translate a source header into a storage-safe column name: trimmed,
/// lowercased, diacritics stripped, and every run of characters outside
/// `[a-z0-9]` collapsed into one underscore (never leading or trailing).
///
/// `"Cat Resolución 1"` and `"cat resolucion 1"` both map to `cat_resolucion_1`.
pub fn canonical_column_name(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_separator = false;
    for ch in header
        .trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
    {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch);
        } else {
            pending_separator = true;
        }
    }
    out
}

pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// One external entity normalized into canonical fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub natural_key: String,
    pub partition: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, CellValue>,
}

impl Record {
    pub fn new(natural_key: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            partition: None,
            updated_at: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: CellValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn set_text<S: Into<String>>(&mut self, name: impl Into<String>, value: Option<S>) {
        let cell = value.map(|v| CellValue::Text(v.into())).unwrap_or(CellValue::Null);
        self.set(name, cell);
    }

    pub fn set_timestamp(&mut self, name: impl Into<String>, value: Option<DateTime<Utc>>) {
        let cell = value.map(CellValue::Timestamp).unwrap_or(CellValue::Null);
        self.set(name, cell);
    }

    pub fn get(&self, name: &str) -> &CellValue {
        self.fields.get(name).unwrap_or(&NULL_CELL)
    }

    /// True when this record should replace `other` for the same key. A
    /// missing timestamp ranks below any present one and equal timestamps do
    /// not supersede.
    pub fn supersedes(&self, other: &Record) -> bool {
        self.updated_at > other.updated_at
    }

    /// True when the record is strictly newer than the sync point. Records
    /// without a timestamp cannot be placed and are always kept.
    pub fn is_after(&self, since: Option<DateTime<Utc>>) -> bool {
        match (since, self.updated_at) {
            (None, _) | (Some(_), None) => true,
            (Some(since), Some(updated_at)) => updated_at > since,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Timestamp)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Json)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("`{0}` is not a safe lowercase identifier")]
    UnsafeIdentifier(String),
    #[error("column `{0}` is declared twice")]
    DuplicateColumn(String),
    #[error("{role} column `{column}` is not declared")]
    MissingColumn { role: &'static str, column: String },
    #[error("column `{column}` must be of kind {expected:?}")]
    WrongKind { column: String, expected: ColumnKind },
}

/// Fixed canonical schema of one target table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSpec {
    name: String,
    key_column: String,
    updated_at_column: String,
    partition_column: Option<String>,
    columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(
        name: impl Into<String>,
        key_column: impl Into<String>,
        updated_at_column: impl Into<String>,
        partition_column: Option<&str>,
        columns: Vec<ColumnSpec>,
    ) -> Result<Self, SchemaError> {
        let spec = Self {
            name: name.into(),
            key_column: key_column.into(),
            updated_at_column: updated_at_column.into(),
            partition_column: partition_column.map(ToString::to_string),
            columns,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if !is_safe_identifier(&self.name) {
            return Err(SchemaError::UnsafeIdentifier(self.name.clone()));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_safe_identifier(&column.name) {
                return Err(SchemaError::UnsafeIdentifier(column.name.clone()));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
        }
        self.require_column("key", &self.key_column, ColumnKind::Text)?;
        self.require_column("updated-at", &self.updated_at_column, ColumnKind::Timestamp)?;
        if let Some(partition) = &self.partition_column {
            self.require_column("partition", partition, ColumnKind::Text)?;
        }
        Ok(())
    }

    fn require_column(
        &self,
        role: &'static str,
        name: &str,
        expected: ColumnKind,
    ) -> Result<(), SchemaError> {
        let column = self.column(name).ok_or_else(|| SchemaError::MissingColumn {
            role,
            column: name.to_string(),
        })?;
        if column.kind != expected {
            return Err(SchemaError::WrongKind {
                column: name.to_string(),
                expected,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn updated_at_column(&self) -> &str {
        &self.updated_at_column
    }

    pub fn partition_column(&self) -> Option<&str> {
        self.partition_column.as_deref()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(move |c| c.name != self.key_column)
    }

    /// Project a record onto the column list, in column order. Key, updated-at
    /// and partition columns come from the record's typed attributes; every
    /// other column reads the same-named field, `Null` when absent. Fields
    /// with no matching column are ignored.
    pub fn row_values(&self, record: &Record) -> Vec<CellValue> {
        self.columns
            .iter()
            .map(|column| {
                let cell = if column.name == self.key_column {
                    CellValue::Text(record.natural_key.clone())
                } else if column.name == self.updated_at_column && record.updated_at.is_some() {
                    record
                        .updated_at
                        .map(CellValue::Timestamp)
                        .unwrap_or(CellValue::Null)
                } else if Some(column.name.as_str()) == self.partition_column.as_deref()
                    && record.partition.is_some()
                {
                    record
                        .partition
                        .clone()
                        .map(CellValue::Text)
                        .unwrap_or(CellValue::Null)
                } else {
                    record.get(&column.name).clone()
                };
                cell.coerce(column.kind)
            })
            .collect()
    }

    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                if c.name == self.key_column {
                    format!("\"{}\" {} PRIMARY KEY", c.name, c.kind.sql_type())
                } else {
                    format!("\"{}\" {}", c.name, c.kind.sql_type())
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS \"{}\" ({})", self.name, columns)
    }
}

//! Self-describing data-frame schema and field values.
//!
//! Instruments report their measurement record layout as a human-readable
//! table (the `??D*` reply). The first row is a header naming at least the
//! `NAME` and `TYPE` columns; column boundaries are located by the word
//! positions in that header. Fields whose name begins with `*` only appear
//! in extended frame variants, so the standard schema is the non-`*` prefix.

use std::fmt;
use std::time::SystemTime;

use indexmap::IndexMap;
use serde::Serialize;

use crate::{Error, Result};

/// One measurement record, keyed by schema field name in schema order.
pub type DataFrame = IndexMap<String, Value>;

/// Field kinds reported in the `TYPE` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Decimal,
    Text,
    Timestamp,
    Enum,
}

impl FieldKind {
    /// Classifies a `TYPE` cell. Any type containing `decimal` is parsed as
    /// a floating-point number in subsequent frames.
    pub fn parse(type_cell: &str) -> Self {
        let lower = type_cell.to_ascii_lowercase();

        if lower.contains("decimal") {
            Self::Decimal
        } else if lower.contains("int") {
            Self::Integer
        } else if lower.contains("time") || lower.contains("stamp") {
            Self::Timestamp
        } else if lower.contains("enum") {
            Self::Enum
        } else {
            Self::Text
        }
    }
}

impl From<FieldKind> for &'static str {
    fn from(k: FieldKind) -> Self {
        match k {
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Text => "text",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Enum => "enum",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// One field of a device's data frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DfField {
    name: String,
    kind: FieldKind,
    extended: bool,
}

impl DfField {
    /// Get the field name (without the `*` extended marker).
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Get the field kind.
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Gets whether the field only appears in extended frame variants.
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

/// Ordered field list discovered from the `??D*` self-description.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DfSchema {
    fields: Vec<DfField>,
}

impl DfSchema {
    /// Parses the `??D*` reply lines into a schema.
    pub fn parse(lines: &[String]) -> Result<Self> {
        let header = lines
            .first()
            .ok_or_else(|| Error::decode("empty data-frame description"))?;

        let columns = column_starts(header);
        let name_col = find_column(header, &columns, "NAME")?;
        let type_col = find_column(header, &columns, "TYPE")?;

        let mut fields = Vec::new();

        for row in &lines[1..] {
            let name_cell = cell(row, &columns, name_col);
            let type_cell = cell(row, &columns, type_col);

            if name_cell.is_empty() {
                continue;
            }

            let extended = name_cell.starts_with('*');
            fields.push(DfField {
                name: name_cell.trim_start_matches('*').to_string(),
                kind: FieldKind::parse(&type_cell),
                extended,
            });
        }

        if fields.is_empty() {
            return Err(Error::decode("data-frame description names no fields"));
        }

        Ok(Self { fields })
    }

    /// Get every field, extended variants included.
    pub fn fields(&self) -> &[DfField] {
        self.fields.as_slice()
    }

    /// Iterate the standard (non-extended) field prefix.
    pub fn standard(&self) -> impl Iterator<Item = &DfField> {
        self.fields.iter().filter(|f| !f.is_extended())
    }

    /// Number of fields in the standard frame.
    pub fn standard_len(&self) -> usize {
        self.standard().count()
    }

    /// Builds a [DataFrame] from the value tokens of a standard frame.
    ///
    /// The token count must equal the standard schema length.
    pub fn frame(&self, tokens: &[&str]) -> Result<DataFrame> {
        let expected = self.standard_len();

        if tokens.len() != expected {
            return Err(Error::decode(format!(
                "expected {expected} frame columns, have: {}",
                tokens.len()
            )));
        }

        let mut frame = DataFrame::with_capacity(expected);

        for (field, token) in self.standard().zip(tokens) {
            frame.insert(field.name().to_string(), Value::coerce(token, field.kind())?);
        }

        Ok(frame)
    }
}

/// A single data-frame cell value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Floating-point reading.
    Decimal(f64),
    /// Raw token (names, enumerations, integers the device formats itself).
    Text(String),
    /// Host-side wall-clock annotation.
    Timestamp(SystemTime),
    /// The device's `--` no-value sentinel.
    None,
}

impl Value {
    /// Coerces one response token according to the field kind.
    ///
    /// The `--` sentinel maps to [Value::None] for every kind; decimal
    /// fields must parse as floating point.
    pub fn coerce(token: &str, kind: FieldKind) -> Result<Self> {
        if token == "--" {
            return Ok(Self::None);
        }

        match kind {
            FieldKind::Decimal => token
                .parse::<f64>()
                .map(Self::Decimal)
                .map_err(|_| Error::decode(format!("expected a decimal, have: {token}"))),
            _ => Ok(Self::Text(token.to_string())),
        }
    }

    /// Get the reading as a float, if it is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the token text, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Gets whether this is the no-value sentinel.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Timestamp(t) => write!(f, "{t:?}"),
            Self::None => write!(f, "--"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<SystemTime> for Value {
    fn from(t: SystemTime) -> Self {
        Self::Timestamp(t)
    }
}

/// Byte offsets where header words begin.
fn column_starts(header: &str) -> Vec<usize> {
    let bytes = header.as_bytes();
    let mut starts = Vec::new();
    let mut in_word = false;

    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_whitespace() {
            in_word = false;
        } else if !in_word {
            starts.push(i);
            in_word = true;
        }
    }

    starts
}

fn find_column(header: &str, columns: &[usize], title: &str) -> Result<usize> {
    columns
        .iter()
        .position(|&start| {
            let end = column_end(columns, header, start);
            header[start..end].contains(title)
        })
        .ok_or_else(|| Error::decode(format!("data-frame header missing {title} column")))
}

fn column_end(columns: &[usize], row: &str, start: usize) -> usize {
    columns
        .iter()
        .find(|&&s| s > start)
        .copied()
        .unwrap_or(row.len())
        .min(row.len())
}

/// Extracts and trims the cell of `row` under column `idx` of the header.
fn cell(row: &str, columns: &[usize], idx: usize) -> String {
    let Some(&start) = columns.get(idx) else {
        return String::new();
    };

    if start >= row.len() {
        return String::new();
    }

    let end = match columns.get(idx + 1) {
        Some(&next) => next.min(row.len()),
        None => row.len(),
    };

    row[start..end].trim().to_string()
}

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::ValidationError;

// ---- Native values ----

/// A metadata value as the database stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

pub type Metadata = BTreeMap<String, MetadataValue>;

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Int(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(x: f64) -> Self {
        MetadataValue::Float(x)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

// ---- Form values ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetadataValueType {
    #[default]
    String,
    Number,
    Boolean,
}

impl MetadataValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataValueType::String => "string",
            MetadataValueType::Number => "number",
            MetadataValueType::Boolean => "boolean",
        }
    }
}

/// One editable metadata field: the raw text the user sees plus its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TypedField {
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: MetadataValueType,
}

impl TypedField {
    pub fn new(value: impl Into<String>, value_type: MetadataValueType) -> Self {
        Self {
            value: value.into(),
            value_type,
        }
    }

    pub fn blank(value_type: MetadataValueType) -> Self {
        Self::new(String::new(), value_type)
    }

    pub fn is_blank(&self) -> bool {
        self.value.trim().is_empty()
    }
}

pub type TypedMetadata = BTreeMap<String, TypedField>;

// ---- Inference ----

fn numeric_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").expect("numeric pattern")
    })
}

fn integer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[+-]?\d+$").expect("integer pattern"))
}

/// True when the trimmed text reads as a decimal number.
pub fn is_numeric_string(s: &str) -> bool {
    numeric_pattern().is_match(s.trim())
}

/// Parse numeric-looking text, preferring an integer representation.
pub fn parse_number(s: &str) -> Option<MetadataValue> {
    let trimmed = s.trim();
    if !is_numeric_string(trimmed) {
        return None;
    }
    if integer_pattern().is_match(trimmed) {
        if let Ok(i) = trimmed.parse::<i64>() {
            return Some(MetadataValue::Int(i));
        }
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|x| x.is_finite())
        .map(MetadataValue::Float)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// The single place a native value's form type is decided.
pub fn classify(value: &MetadataValue) -> MetadataValueType {
    match value {
        MetadataValue::Bool(_) => MetadataValueType::Boolean,
        MetadataValue::Int(_) | MetadataValue::Float(_) => MetadataValueType::Number,
        MetadataValue::Str(_) => MetadataValueType::String,
    }
}

pub fn infer_from_string(s: &str) -> MetadataValueType {
    if parse_bool(s).is_some() {
        MetadataValueType::Boolean
    } else if parse_number(s).is_some() {
        MetadataValueType::Number
    } else {
        MetadataValueType::String
    }
}

// ---- Conversions ----

pub fn metadata_to_typed(metadata: &Metadata) -> TypedMetadata {
    metadata
        .iter()
        .map(|(key, value)| (key.clone(), TypedField::new(value.to_string(), classify(value))))
        .collect()
}

/// Build form fields from raw text, taking the type from `hints` when one is
/// known for the key and inferring it from the text otherwise.
pub fn string_metadata_to_typed(
    strings: &BTreeMap<String, String>,
    hints: &BTreeMap<String, MetadataValueType>,
) -> TypedMetadata {
    strings
        .iter()
        .map(|(key, value)| {
            let value_type = hints
                .get(key)
                .copied()
                .unwrap_or_else(|| infer_from_string(value));
            (key.clone(), TypedField::new(value.clone(), value_type))
        })
        .collect()
}

/// Convert one field to its native value. Blank fields yield `None`.
pub fn parse_typed_value(
    key: &str,
    field: &TypedField,
) -> Result<Option<MetadataValue>, ValidationError> {
    if field.is_blank() {
        return Ok(None);
    }
    match field.value_type {
        MetadataValueType::String => Ok(Some(MetadataValue::Str(field.value.clone()))),
        MetadataValueType::Number => parse_number(&field.value).map(Some).ok_or_else(|| {
            ValidationError::Field(format!("Metadata field \"{}\" must be a number", key))
        }),
        MetadataValueType::Boolean => parse_bool(&field.value)
            .map(|b| Some(MetadataValue::Bool(b)))
            .ok_or_else(|| {
                ValidationError::Field(format!(
                    "Metadata field \"{}\" must be true or false",
                    key
                ))
            }),
    }
}

pub fn validate_typed_metadata(fields: &TypedMetadata) -> Result<(), ValidationError> {
    for (key, field) in fields {
        if key.trim().is_empty() {
            if field.is_blank() {
                continue;
            }
            return Err(ValidationError::Field("Metadata key is required".to_string()));
        }
        parse_typed_value(key, field)?;
    }
    Ok(())
}

/// Convert form fields to the native map sent to the database. Blank fields are
/// dropped; `None` means there is no metadata at all.
pub fn typed_metadata_to_chroma_format(
    fields: &TypedMetadata,
) -> Result<Option<Metadata>, ValidationError> {
    validate_typed_metadata(fields)?;
    let mut out = Metadata::new();
    for (key, field) in fields {
        if key.trim().is_empty() {
            continue;
        }
        if let Some(value) = parse_typed_value(key, field)? {
            out.insert(key.trim().to_string(), value);
        }
    }
    Ok(if out.is_empty() { None } else { Some(out) })
}

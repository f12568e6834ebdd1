use serde::{Deserialize, Serialize};

use crate::error::VnaError;

/// Error queue code meaning the queue is empty.
pub const NO_ERROR_CODE: i32 = 0;

/// A single parsed reply field
#[derive(Debug, Clone, PartialEq)]
pub enum ScpiValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl From<i64> for ScpiValue {
    fn from(value: i64) -> Self {
        ScpiValue::Int(value)
    }
}

impl From<f64> for ScpiValue {
    fn from(value: f64) -> Self {
        ScpiValue::Float(value)
    }
}

impl From<bool> for ScpiValue {
    fn from(value: bool) -> Self {
        ScpiValue::Bool(value)
    }
}

impl From<String> for ScpiValue {
    fn from(value: String) -> Self {
        ScpiValue::String(value)
    }
}

impl From<&str> for ScpiValue {
    fn from(value: &str) -> Self {
        ScpiValue::String(value.to_string())
    }
}

impl ScpiValue {
    /// Extract an integer value with type checking
    pub fn as_i64(&self) -> Result<i64, VnaError> {
        match self {
            ScpiValue::Int(v) => Ok(*v),
            _ => Err(type_error("integer", self)),
        }
    }

    /// Extract a float; integers are widened
    pub fn as_f64(&self) -> Result<f64, VnaError> {
        match self {
            ScpiValue::Float(v) => Ok(*v),
            ScpiValue::Int(v) => Ok(*v as f64),
            _ => Err(type_error("float", self)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, VnaError> {
        match self {
            ScpiValue::Bool(v) => Ok(*v),
            _ => Err(type_error("boolean", self)),
        }
    }

    pub fn as_str(&self) -> Result<&str, VnaError> {
        match self {
            ScpiValue::String(v) => Ok(v),
            _ => Err(type_error("string", self)),
        }
    }
}

fn type_error(expected: &str, got: &impl std::fmt::Debug) -> VnaError {
    VnaError::malformed(format!("{got:?}"), format!("expected {expected}"))
}

/// Type a reply field is parsed into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Float,
    Boolean,
    String,
}

/// Shape of the reply a query is expected to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// The whole reply line as one string, unparsed
    Raw,
    /// Exactly one field
    Scalar(ValueType),
    /// Comma-delimited fields, all of the same type
    List(ValueType),
    /// One quoted string holding comma-separated names, e.g. `"CH1_S11,S11"`
    Catalog,
    /// Definite-length binary block
    Block,
}

/// Result of a query
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Scalar(ScpiValue),
    List(Vec<ScpiValue>),
    Block(Vec<u8>),
}

impl Reply {
    pub fn as_scalar(&self) -> Result<&ScpiValue, VnaError> {
        match self {
            Reply::Scalar(v) => Ok(v),
            _ => Err(type_error("scalar reply", self)),
        }
    }

    pub fn as_list(&self) -> Result<&[ScpiValue], VnaError> {
        match self {
            Reply::List(v) => Ok(v),
            _ => Err(type_error("list reply", self)),
        }
    }

    /// Take the payload of a block reply
    pub fn into_block(self) -> Result<Vec<u8>, VnaError> {
        match self {
            Reply::Block(bytes) => Ok(bytes),
            other => Err(type_error("block reply", &other)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, VnaError> {
        self.as_scalar()?.as_f64()
    }

    pub fn as_i64(&self) -> Result<i64, VnaError> {
        self.as_scalar()?.as_i64()
    }

    pub fn as_bool(&self) -> Result<bool, VnaError> {
        self.as_scalar()?.as_bool()
    }

    pub fn as_str(&self) -> Result<&str, VnaError> {
        self.as_scalar()?.as_str()
    }

    /// List reply as strings (also used for catalogs)
    pub fn as_strings(&self) -> Result<Vec<String>, VnaError> {
        self.as_list()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn as_f64_list(&self) -> Result<Vec<f64>, VnaError> {
        self.as_list()?.iter().map(ScpiValue::as_f64).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

/// One entry popped from the instrument error queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: i32,
    pub message: String,
    pub severity: Severity,
}

impl ErrorEntry {
    pub fn new(code: i32, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code,
            message: message.into(),
            severity,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

/// Non-fatal queue entries collected while a command completed
pub type Warnings = Vec<ErrorEntry>;

/// Classify an error-queue code.
///
/// -100..=-499 are command, execution, device and query errors. -500..=-899
/// are status events (power on, user request, request control, operation
/// complete). Positive codes are instrument-defined and fatal unless the
/// caller demotes them.
pub fn classify_code(code: i32, warning_codes: &[i32]) -> Severity {
    if warning_codes.contains(&code) {
        return Severity::Warning;
    }
    match code {
        -899..=-500 => Severity::Warning,
        _ => Severity::Fatal,
    }
}

/// Instrument identity as reported by `*IDN?`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentId {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

/// Port and source layout reported by the instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub port_count: u32,
    pub port_catalog: Vec<String>,
    pub source_count: u32,
    pub source_catalog: Vec<String>,
}

/// Frequency (x) and formatted data (y) of one measurement
#[derive(Debug, Clone, PartialEq)]
pub struct TraceData {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_code() {
        assert_eq!(classify_code(-113, &[]), Severity::Fatal);
        assert_eq!(classify_code(-222, &[]), Severity::Fatal);
        assert_eq!(classify_code(-800, &[]), Severity::Warning);
        assert_eq!(classify_code(-500, &[]), Severity::Warning);
        assert_eq!(classify_code(201, &[]), Severity::Fatal);
        assert_eq!(classify_code(201, &[201]), Severity::Warning);
    }

    #[test]
    fn test_reply_extraction() {
        let reply = Reply::Scalar(ScpiValue::Int(4));
        assert_eq!(reply.as_i64().unwrap(), 4);
        assert_eq!(reply.as_f64().unwrap(), 4.0);
        assert!(reply.as_str().is_err());

        let list = Reply::List(vec!["a".into(), "b".into()]);
        assert_eq!(list.as_strings().unwrap(), vec!["a", "b"]);
        assert!(list.clone().into_block().is_err());
    }
}

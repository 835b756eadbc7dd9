//! Job arguments and payloads.
//!
//! Arguments are deliberately primitive: identifiers and small scalars that a
//! unit can use to re-fetch whatever it needs. Floats, objects and nested
//! arrays are rejected at deserialization time.

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::id::RecordId;
use crate::name::MigrationName;

/// One primitive job argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<RecordId> for ArgValue {
    fn from(value: RecordId) -> Self {
        Self::Int(value.get())
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl core::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArgValue::Null => f.write_str("null"),
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Int(i) => write!(f, "{i}"),
            ArgValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Ordered argument list passed to `MigrationUnit::perform`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentList(Vec<ArgValue>);

impl ArgumentList {
    pub fn new(values: Vec<ArgValue>) -> Self {
        Self(values)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Single record identifier, the common case.
    pub fn record(id: i64) -> Self {
        Self(vec![ArgValue::Int(id)])
    }

    pub fn push(mut self, value: impl Into<ArgValue>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&ArgValue> {
        self.0.get(index)
    }

    /// Fail unless exactly `expected` arguments are present.
    pub fn expect_len(&self, expected: usize) -> Result<(), MigrationError> {
        if self.0.len() != expected {
            return Err(MigrationError::invalid_arguments(format!(
                "expected {expected} argument(s), got {}",
                self.0.len()
            )));
        }
        Ok(())
    }

    pub fn int(&self, index: usize) -> Result<i64, MigrationError> {
        match self.0.get(index) {
            Some(ArgValue::Int(i)) => Ok(*i),
            Some(other) => Err(MigrationError::invalid_arguments(format!(
                "argument {index} must be an integer, got {other}"
            ))),
            None => Err(missing(index)),
        }
    }

    pub fn str(&self, index: usize) -> Result<&str, MigrationError> {
        match self.0.get(index) {
            Some(ArgValue::Str(s)) => Ok(s),
            Some(other) => Err(MigrationError::invalid_arguments(format!(
                "argument {index} must be a string, got {other}"
            ))),
            None => Err(missing(index)),
        }
    }

    pub fn record_id(&self, index: usize) -> Result<RecordId, MigrationError> {
        self.int(index).map(RecordId)
    }
}

impl From<Vec<ArgValue>> for ArgumentList {
    fn from(values: Vec<ArgValue>) -> Self {
        Self(values)
    }
}

impl FromIterator<ArgValue> for ArgumentList {
    fn from_iter<T: IntoIterator<Item = ArgValue>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn missing(index: usize) -> MigrationError {
    MigrationError::invalid_arguments(format!("argument {index} is missing"))
}

/// What gets queued: the unit to run and what to run it with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobPayload {
    pub name: MigrationName,
    pub args: ArgumentList,
}

impl JobPayload {
    pub fn new(name: MigrationName, args: ArgumentList) -> Self {
        Self { name, args }
    }
}

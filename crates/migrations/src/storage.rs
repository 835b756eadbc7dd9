//! Narrow storage access for migration units.
//!
//! Units fetch a row by identifier and update individual columns. There is no
//! way to issue arbitrary queries or to go through application validation:
//! field-level writes keep concurrent runs against different columns of the
//! same row from clobbering each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use bgmigrate_core::{MigrationError, RecordId};

/// A single column value as seen by a migration unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Convert a column value decoded from a JSON row representation.
    ///
    /// Structured values (json/jsonb columns) and non-integral numbers come
    /// back as their JSON text so units can parse them on their own terms.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Text(n.to_string()),
            },
            JsonValue::String(s) => FieldValue::Text(s),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

/// A fetched row: column name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, FieldValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: FieldValue) -> Self {
        self.0.insert(column.into(), value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: FieldValue) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.0.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(FieldValue::as_text)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The store could not be reached or timed out.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A table or column name was rejected before reaching the store.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// The store answered with something that could not be decoded.
    #[error("failed to decode row: {0}")]
    Decode(String),
    /// The store refused the statement (missing column, constraint, type).
    #[error("statement rejected: {0}")]
    Rejected(String),
}

impl From<StorageError> for MigrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => MigrationError::Transient(msg),
            other => MigrationError::Fatal(other.to_string()),
        }
    }
}

/// Storage interface handed to migration units.
pub trait RecordStore: Send + Sync {
    /// Fetch a row by primary key. `Ok(None)` means the row does not exist.
    fn fetch(&self, table: &str, id: RecordId) -> Result<Option<Record>, StorageError>;

    /// Set a single column on a row.
    ///
    /// Returns `false` if the row does not exist (nothing was written).
    fn update_field(
        &self,
        table: &str,
        id: RecordId,
        column: &str,
        value: FieldValue,
    ) -> Result<bool, StorageError>;
}

impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    fn fetch(&self, table: &str, id: RecordId) -> Result<Option<Record>, StorageError> {
        (**self).fetch(table, id)
    }

    fn update_field(
        &self,
        table: &str,
        id: RecordId,
        column: &str,
        value: FieldValue,
    ) -> Result<bool, StorageError> {
        (**self).update_field(table, id, column, value)
    }
}

/// Validate a SQL identifier (table or column name).
///
/// Only lowercase ASCII letters, digits and `_` are accepted, starting with a
/// letter or `_`, so the name can be interpolated into a statement verbatim.
pub fn validate_identifier(ident: &str) -> Result<&str, StorageError> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && ident.len() <= 63 {
        Ok(ident)
    } else {
        Err(StorageError::InvalidIdentifier(ident.to_string()))
    }
}

type Table = BTreeMap<RecordId, Record>;

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<HashMap<String, Table>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert (or replace) a whole row. Test/setup helper, not part of the
    /// interface units get to see.
    pub fn insert(&self, table: &str, id: RecordId, record: Record) -> Result<(), StorageError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::Unavailable("lock poisoned".to_string()))?;
        tables.entry(table.to_string()).or_default().insert(id, record);
        Ok(())
    }

    pub fn delete(&self, table: &str, id: RecordId) -> Result<bool, StorageError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::Unavailable("lock poisoned".to_string()))?;
        Ok(tables.get_mut(table).is_some_and(|t| t.remove(&id).is_some()))
    }

    /// Snapshot of a whole table, for comparing states in tests.
    pub fn table(&self, table: &str) -> BTreeMap<RecordId, Record> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful field updates so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

impl RecordStore for InMemoryRecordStore {
    fn fetch(&self, table: &str, id: RecordId) -> Result<Option<Record>, StorageError> {
        self.check_available()?;
        validate_identifier(table)?;
        let tables = self
            .tables
            .read()
            .map_err(|_| StorageError::Unavailable("lock poisoned".to_string()))?;
        Ok(tables.get(table).and_then(|t| t.get(&id)).cloned())
    }

    fn update_field(
        &self,
        table: &str,
        id: RecordId,
        column: &str,
        value: FieldValue,
    ) -> Result<bool, StorageError> {
        self.check_available()?;
        validate_identifier(table)?;
        validate_identifier(column)?;
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::Unavailable("lock poisoned".to_string()))?;

        match tables.get_mut(table).and_then(|t| t.get_mut(&id)) {
            Some(record) => {
                record.set(column, value);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_touches_only_the_named_column() {
        let store = InMemoryRecordStore::new();
        let id = RecordId(1);
        store.insert(
            "links",
            id,
            Record::new()
                .with("payload", FieldValue::text("{}"))
                .with("url", FieldValue::Null),
        ).unwrap();

        assert!(store.update_field("links", id, "url", FieldValue::text("http://x")).unwrap());

        let row = store.fetch("links", id).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://x"));
        assert_eq!(row.text("payload"), Some("{}"));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn poisoned_store_rejects_inserts() {
        let store = InMemoryRecordStore::arc();
        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _tables = holder.tables.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        let err = store.insert("links", RecordId(1), Record::new()).unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(store.delete("links", RecordId(1)).is_err());
    }

    #[test]
    fn missing_rows_are_not_errors() {
        let store = InMemoryRecordStore::new();
        assert_eq!(store.fetch("links", RecordId(9)).unwrap(), None);
        assert!(!store.update_field("links", RecordId(9), "url", FieldValue::Null).unwrap());
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn outage_maps_to_transient_migration_error() {
        let store = InMemoryRecordStore::new();
        store.set_unavailable(true);

        let err = store.fetch("links", RecordId(1)).unwrap_err();
        assert!(MigrationError::from(err).is_retryable());

        store.set_unavailable(false);
        assert!(store.fetch("links", RecordId(1)).is_ok());
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("email_normalized").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());
        assert!(validate_identifier("Links").is_err());
        assert!(validate_identifier("links; drop table users").is_err());
        assert!(validate_identifier("").is_err());

        let store = InMemoryRecordStore::new();
        let err = store.fetch("bad name", RecordId(1)).unwrap_err();
        assert!(!MigrationError::from(err).is_retryable());
    }

    #[test]
    fn json_values_map_to_fields() {
        assert_eq!(FieldValue::from_json(json!(null)), FieldValue::Null);
        assert_eq!(FieldValue::from_json(json!(7)), FieldValue::Int(7));
        assert_eq!(FieldValue::from_json(json!(true)), FieldValue::Bool(true));
        assert_eq!(FieldValue::from_json(json!("a")), FieldValue::text("a"));
        assert_eq!(
            FieldValue::from_json(json!({"url": "http://x"})),
            FieldValue::text(r#"{"url":"http://x"}"#)
        );
    }
}

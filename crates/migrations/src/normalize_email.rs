//! `NormalizeEmail(user_id)`: fill `users.email_normalized`.

use tracing::debug;

use bgmigrate_core::{ArgumentList, MigrationResult};

use crate::storage::{FieldValue, RecordStore};
use crate::unit::MigrationUnit;

/// Writes the trimmed, lowercased `email` into `email_normalized`.
///
/// A null, non-text or blank email normalizes to `NULL`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeEmail;

impl NormalizeEmail {
    pub const NAME: &'static str = "NormalizeEmail";
    pub const TABLE: &'static str = "users";
    pub const SOURCE_COLUMN: &'static str = "email";
    pub const TARGET_COLUMN: &'static str = "email_normalized";
}

impl MigrationUnit for NormalizeEmail {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn perform(&self, store: &dyn RecordStore, args: &ArgumentList) -> MigrationResult<()> {
        args.expect_len(1)?;
        let id = args.record_id(0)?;

        let Some(record) = store.fetch(Self::TABLE, id)? else {
            debug!(record_id = %id, "user no longer exists; skipping");
            return Ok(());
        };

        let normalized = normalize(record.get(Self::SOURCE_COLUMN));
        let current = record.get(Self::TARGET_COLUMN).unwrap_or(&FieldValue::Null);
        if *current == normalized {
            return Ok(());
        }

        store.update_field(Self::TABLE, id, Self::TARGET_COLUMN, normalized)?;
        Ok(())
    }
}

fn normalize(email: Option<&FieldValue>) -> FieldValue {
    match email.and_then(FieldValue::as_text).map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => FieldValue::Text(trimmed.to_lowercase()),
        _ => FieldValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryRecordStore, Record};
    use bgmigrate_core::RecordId;

    fn user(email: FieldValue) -> Record {
        Record::new().with("email", email)
    }

    #[test]
    fn lowercases_and_trims() {
        let store = InMemoryRecordStore::new();
        store.insert("users", RecordId(1), user(FieldValue::text("  Ada@Example.COM "))).unwrap();

        NormalizeEmail.perform(&store, &ArgumentList::record(1)).unwrap();

        let row = store.fetch("users", RecordId(1)).unwrap().unwrap();
        assert_eq!(row.text("email_normalized"), Some("ada@example.com"));
    }

    #[test]
    fn unusable_emails_default_to_null_once() {
        let store = InMemoryRecordStore::new();
        store.insert("users", RecordId(1), user(FieldValue::text("   "))).unwrap();
        store.insert("users", RecordId(2), user(FieldValue::Int(5))).unwrap();
        store.insert(
            "users",
            RecordId(3),
            user(FieldValue::Null).with("email_normalized", FieldValue::text("stale@x")),
        ).unwrap();

        for id in 1..=3 {
            NormalizeEmail.perform(&store, &ArgumentList::record(id)).unwrap();
        }

        // Only row 3 had a non-null value to clear.
        assert_eq!(store.writes(), 1);
        let row = store.fetch("users", RecordId(3)).unwrap().unwrap();
        assert_eq!(row.get("email_normalized"), Some(&FieldValue::Null));
    }

    #[test]
    fn idempotent_and_tolerates_deleted_users() {
        let store = InMemoryRecordStore::new();
        store.insert("users", RecordId(1), user(FieldValue::text("A@B.C"))).unwrap();

        for _ in 0..3 {
            NormalizeEmail.perform(&store, &ArgumentList::record(1)).unwrap();
            NormalizeEmail.perform(&store, &ArgumentList::record(2)).unwrap();
        }

        assert_eq!(store.writes(), 1);
        assert_eq!(store.fetch("users", RecordId(2)).unwrap(), None);
    }
}

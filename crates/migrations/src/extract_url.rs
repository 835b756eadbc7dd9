//! `ExtractUrl(link_id)`: copy `payload.url` into the dedicated `url` column.

use serde_json::Value as JsonValue;
use tracing::debug;

use bgmigrate_core::{ArgumentList, MigrationResult};

use crate::storage::{FieldValue, RecordStore};
use crate::unit::MigrationUnit;

/// Backfills `links.url` from the JSON document stored in `links.payload`.
///
/// Rows whose payload is not JSON, is not an object, or has no non-empty
/// string `url` are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractUrl;

impl ExtractUrl {
    pub const NAME: &'static str = "ExtractUrl";
    pub const TABLE: &'static str = "links";
    pub const SOURCE_COLUMN: &'static str = "payload";
    pub const TARGET_COLUMN: &'static str = "url";
}

impl MigrationUnit for ExtractUrl {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn perform(&self, store: &dyn RecordStore, args: &ArgumentList) -> MigrationResult<()> {
        args.expect_len(1)?;
        let id = args.record_id(0)?;

        let Some(record) = store.fetch(Self::TABLE, id)? else {
            debug!(record_id = %id, "link no longer exists; skipping");
            return Ok(());
        };

        let Some(url) = record.get(Self::SOURCE_COLUMN).and_then(url_from_payload) else {
            debug!(record_id = %id, "payload carries no url; skipping");
            return Ok(());
        };

        if record.text(Self::TARGET_COLUMN) == Some(url.as_str()) {
            return Ok(());
        }

        // The row may have been deleted since the fetch; that is fine too.
        store.update_field(Self::TABLE, id, Self::TARGET_COLUMN, FieldValue::Text(url))?;
        Ok(())
    }
}

fn url_from_payload(payload: &FieldValue) -> Option<String> {
    let raw = payload.as_text()?;
    let doc: JsonValue = serde_json::from_str(raw).ok()?;
    match doc.get("url")? {
        JsonValue::String(url) if !url.is_empty() => Some(url.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryRecordStore, Record};
    use bgmigrate_core::{MigrationError, RecordId};
    use proptest::prelude::*;

    fn link(payload: &str) -> Record {
        Record::new()
            .with("payload", FieldValue::text(payload))
            .with("url", FieldValue::Null)
    }

    #[test]
    fn copies_url_out_of_payload() {
        let store = InMemoryRecordStore::new();
        store.insert("links", RecordId(42), link(r#"{"url":"http://x"}"#)).unwrap();

        ExtractUrl.perform(&store, &ArgumentList::record(42)).unwrap();

        let row = store.fetch("links", RecordId(42)).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://x"));
    }

    #[test]
    fn deleted_record_is_a_silent_no_op() {
        let store = InMemoryRecordStore::new();

        ExtractUrl.perform(&store, &ArgumentList::record(43)).unwrap();

        assert!(store.table("links").is_empty());
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn malformed_payloads_are_left_alone() {
        let store = InMemoryRecordStore::new();
        let payloads = [
            "not json at all",
            "[1, 2, 3]",
            r#"{"href":"http://x"}"#,
            r#"{"url": 17}"#,
            r#"{"url": ""}"#,
        ];
        for (i, payload) in payloads.iter().enumerate() {
            store.insert("links", RecordId(i as i64), link(payload)).unwrap();
        }
        store.insert("links", RecordId(99), Record::new().with("payload", FieldValue::Null)).unwrap();

        for id in (0..payloads.len() as i64).chain([99]) {
            ExtractUrl.perform(&store, &ArgumentList::record(id)).unwrap();
        }

        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn second_run_does_not_write_again() {
        let store = InMemoryRecordStore::new();
        store.insert("links", RecordId(42), link(r#"{"url":"http://x"}"#)).unwrap();

        ExtractUrl.perform(&store, &ArgumentList::record(42)).unwrap();
        ExtractUrl.perform(&store, &ArgumentList::record(42)).unwrap();

        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn wrong_arguments_are_terminal() {
        let store = InMemoryRecordStore::new();
        let err = ExtractUrl
            .perform(&store, &ArgumentList::new(vec!["42".into()]))
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidArguments(_)));

        let err = ExtractUrl.perform(&store, &ArgumentList::empty()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn outage_is_retryable() {
        let store = InMemoryRecordStore::new();
        store.set_unavailable(true);
        let err = ExtractUrl.perform(&store, &ArgumentList::record(1)).unwrap_err();
        assert!(err.is_retryable());
    }

    fn payload_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z]{1,5}://[a-z0-9./]{0,20}".prop_map(|u| serde_json::json!({ "url": u }).to_string()),
            "[a-z]{0,10}".prop_map(|u| serde_json::json!({ "url": u, "extra": 1 }).to_string()),
            any::<i64>().prop_map(|n| serde_json::json!({ "url": n }).to_string()),
            ".{0,30}",
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: running the unit twice leaves the same table as running it once.
        #[test]
        fn running_twice_equals_running_once(
            payload in payload_strategy(),
            existing in proptest::option::of("[a-z:/.]{0,12}"),
        ) {
            let mut row = link(&payload);
            if let Some(existing) = existing {
                row.set("url", FieldValue::Text(existing));
            }

            let once = InMemoryRecordStore::new();
            once.insert("links", RecordId(1), row.clone()).unwrap();
            ExtractUrl.perform(&once, &ArgumentList::record(1)).unwrap();

            let twice = InMemoryRecordStore::new();
            twice.insert("links", RecordId(1), row).unwrap();
            ExtractUrl.perform(&twice, &ArgumentList::record(1)).unwrap();
            ExtractUrl.perform(&twice, &ArgumentList::record(1)).unwrap();

            prop_assert_eq!(once.table("links"), twice.table("links"));
        }
    }
}

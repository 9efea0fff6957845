//! Telemetry record types and the file-backed record store.
//!
//! One JSON file per ingested report under `<data_dir>/uploads/`, named by
//! the generated record id. Ids start with the unix-millis timestamp, so the
//! lexicographic filename order is also the chronological order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::HubError;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "MQTT")]
    Mqtt,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Mqtt => write!(f, "MQTT"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub source: Source,
}

/// One ingested telemetry report. `data` is an open mapping: device firmware
/// field sets evolve, so nothing downstream may assume a field is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub meta: RecordMeta,
    pub data: Map<String, Value>,
}

/// Time-based id with a random suffix: `<unix-millis>-<8 hex chars>`.
pub fn generate_id(now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    format!("{millis}-{:08x}", fastrand::u32(..))
}

/// Ids are used as filenames and URL path segments; anything outside the
/// generated alphabet is rejected before it reaches the filesystem.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct RecordStore {
    dir: PathBuf,
    /// Serialises mutation; reads go straight to the directory.
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub async fn open(dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn append(&self, record: &TelemetryRecord) -> Result<(), HubError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let _guard = self.write_lock.lock().await;
        tokio::fs::write(self.path_for(&record.meta.id), bytes).await?;
        Ok(())
    }

    /// All record ids, ascending (chronological).
    async fn list_ids(&self) -> Result<Vec<String>, HubError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read_record(&self, id: &str) -> Option<TelemetryRecord> {
        let bytes = tokio::fs::read(self.path_for(id)).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(id, "skipping unparseable record: {e}");
                None
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<TelemetryRecord> {
        if !is_valid_id(id) {
            return None;
        }
        self.read_record(id).await
    }

    /// Most recent record. Reflects every `append` that completed before
    /// this call began; two records in the same millisecond are ordered by
    /// their full ingestion timestamp, not the random id suffix.
    pub async fn latest(&self) -> Result<Option<TelemetryRecord>, HubError> {
        Ok(self.list_all().await?.pop())
    }

    /// All records, ascending by ingestion timestamp.
    pub async fn list_all(&self) -> Result<Vec<TelemetryRecord>, HubError> {
        let ids = self.list_ids().await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(record) = self.read_record(id).await {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.meta
                .time
                .cmp(&b.meta.time)
                .then_with(|| a.meta.id.cmp(&b.meta.id))
        });
        Ok(records)
    }

    /// Returns `false` when no such record exists.
    pub async fn delete(&self, id: &str) -> Result<bool, HubError> {
        if !is_valid_id(id) {
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every record, returning how many were deleted.
    pub async fn delete_all(&self) -> Result<usize, HubError> {
        let _guard = self.write_lock.lock().await;
        let mut deleted = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".json") {
                tokio::fs::remove_file(entry.path()).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::Duration;

    fn record_at(id: &str, time: OffsetDateTime, lux: i64) -> TelemetryRecord {
        let mut data = Map::new();
        data.insert("lux".to_string(), json!(lux));
        TelemetryRecord {
            meta: RecordMeta {
                id: id.to_string(),
                time,
                source: Source::Http,
            },
            data,
        }
    }

    async fn test_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("uploads")).await.unwrap();
        (dir, store)
    }

    // -- Id generation ----------------------------------------------------

    #[test]
    fn generated_id_has_millis_prefix_and_hex_suffix() {
        let now = OffsetDateTime::now_utc();
        let id = generate_id(now);
        let (prefix, suffix) = id.split_once('-').unwrap();
        assert_eq!(prefix.parse::<i128>().unwrap(), now.unix_timestamp_nanos() / 1_000_000);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let now = OffsetDateTime::now_utc();
        let ids: Vec<String> = (0..8).map(|_| generate_id(now)).collect();
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn id_validation_rejects_path_escapes() {
        assert!(is_valid_id("1700000000000-deadbeef"));
        assert!(!is_valid_id("../../etc/passwd"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(""));
    }

    // -- Append / latest --------------------------------------------------

    #[tokio::test]
    async fn latest_reflects_most_recent_append() {
        let (_dir, store) = test_store().await;
        let t0 = OffsetDateTime::now_utc();

        store.append(&record_at("100-aa", t0, 10)).await.unwrap();
        store
            .append(&record_at("200-bb", t0 + Duration::seconds(1), 20))
            .await
            .unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.meta.id, "200-bb");
        assert_eq!(latest.data["lux"], json!(20));
    }

    #[tokio::test]
    async fn latest_on_empty_store_is_none() {
        let (_dir, store) = test_store().await;
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identical_payloads_produce_distinct_records() {
        let (_dir, store) = test_store().await;
        let t0 = OffsetDateTime::now_utc();

        store.append(&record_at("100-aa", t0, 10)).await.unwrap();
        store.append(&record_at("100-bb", t0, 10)).await.unwrap();

        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    // -- list_all ordering ------------------------------------------------

    #[tokio::test]
    async fn list_all_is_ascending_by_time() {
        let (_dir, store) = test_store().await;
        let t0 = OffsetDateTime::now_utc();

        // Insert out of order.
        store
            .append(&record_at("300-cc", t0 + Duration::seconds(2), 3))
            .await
            .unwrap();
        store.append(&record_at("100-aa", t0, 1)).await.unwrap();
        store
            .append(&record_at("200-bb", t0 + Duration::seconds(1), 2))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.meta.id)
            .collect();
        assert_eq!(ids, vec!["100-aa", "200-bb", "300-cc"]);
    }

    // -- get / delete -----------------------------------------------------

    #[tokio::test]
    async fn get_returns_stored_record() {
        let (_dir, store) = test_store().await;
        store
            .append(&record_at("100-aa", OffsetDateTime::now_utc(), 42))
            .await
            .unwrap();

        let record = store.get("100-aa").await.unwrap();
        assert_eq!(record.data["lux"], json!(42));
        assert!(store.get("999-zz").await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_one_record() {
        let (_dir, store) = test_store().await;
        let t0 = OffsetDateTime::now_utc();
        store.append(&record_at("100-aa", t0, 1)).await.unwrap();
        store.append(&record_at("200-bb", t0, 2)).await.unwrap();

        assert!(store.delete("100-aa").await.unwrap());
        assert!(!store.delete("100-aa").await.unwrap()); // already gone

        let remaining = store.list_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].meta.id, "200-bb");
    }

    #[tokio::test]
    async fn delete_all_empties_the_store() {
        let (_dir, store) = test_store().await;
        let t0 = OffsetDateTime::now_utc();
        store.append(&record_at("100-aa", t0, 1)).await.unwrap();
        store.append(&record_at("200-bb", t0, 2)).await.unwrap();

        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.list_all().await.unwrap().is_empty());
        assert!(store.latest().await.unwrap().is_none());
    }

    // -- Corrupt files ----------------------------------------------------

    #[tokio::test]
    async fn unparseable_file_is_skipped() {
        let (_dir, store) = test_store().await;
        store
            .append(&record_at("100-aa", OffsetDateTime::now_utc(), 1))
            .await
            .unwrap();
        tokio::fs::write(store.path_for("200-bb"), b"not json")
            .await
            .unwrap();

        assert_eq!(store.list_all().await.unwrap().len(), 1);
        // latest() falls back past the corrupt newest file.
        assert_eq!(store.latest().await.unwrap().unwrap().meta.id, "100-aa");
    }

    // -- Record serialization layout --------------------------------------

    #[test]
    fn record_serializes_with_meta_and_data() {
        let record = record_at("100-aa", OffsetDateTime::UNIX_EPOCH, 7);
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["meta"]["id"], "100-aa");
        assert_eq!(v["meta"]["source"], "HTTP");
        assert_eq!(v["meta"]["time"], "1970-01-01T00:00:00Z");
        assert_eq!(v["data"]["lux"], 7);
    }
}

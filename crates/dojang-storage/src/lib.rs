//! Partitioned ranking record store (redb) + HTTP fetch utilities for the dojang tracker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dojang_core::{player_key, PartitionKey, RankRecord};
use redb::{Database, ReadTransaction, ReadOnlyTable, ReadableTable, Table, TableDefinition, TableError};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "dojang-storage";

const META_START: &str = "start";
const META_END: &str = "end";

type RecordTableDef<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening database: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("starting transaction: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("opening table: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("committing transaction: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("metadata {key:?} holds {len} bytes, expected 8")]
    CorruptMetadata { key: String, len: usize },
}

/// Unix-second bounds of everything collected into one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionWindow {
    pub start: i64,
    pub end: i64,
}

/// Snapshot of one player's rows in one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerView {
    pub recent: Option<RankRecord>,
    pub best: Option<RankRecord>,
    pub window: Option<CollectionWindow>,
}

pub fn encode_timestamp(timestamp: i64) -> [u8; 8] {
    timestamp.to_be_bytes()
}

pub fn decode_timestamp(key: &str, bytes: &[u8]) -> Result<i64, StoreError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StoreError::CorruptMetadata {
        key: key.to_string(),
        len: bytes.len(),
    })?;
    Ok(i64::from_be_bytes(raw))
}

struct TableNames {
    recent: String,
    best: String,
    metadata: String,
}

impl TableNames {
    fn for_partition(key: PartitionKey) -> Self {
        Self {
            recent: format!("recent-{key}"),
            best: format!("best-{key}"),
            metadata: format!("metadata-{key}"),
        }
    }
}

fn table_def(name: &str) -> RecordTableDef<'_> {
    TableDefinition::new(name)
}

fn read_record<T>(table: &T, player: &str) -> Result<Option<RankRecord>, StoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(player)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn read_timestamp<T>(table: &T, key: &str) -> Result<Option<i64>, StoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => decode_timestamp(key, guard.value()).map(Some),
        None => Ok(None),
    }
}

fn read_window<T>(table: &T) -> Result<Option<CollectionWindow>, StoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match (read_timestamp(table, META_START)?, read_timestamp(table, META_END)?) {
        (Some(start), Some(end)) => Ok(Some(CollectionWindow { start, end })),
        _ => Ok(None),
    }
}

/// Write access to one partition inside an open transaction.
pub struct PartitionWriter<'txn> {
    key: PartitionKey,
    recent: Table<'txn, &'static str, &'static [u8]>,
    best: Table<'txn, &'static str, &'static [u8]>,
    metadata: Table<'txn, &'static str, &'static [u8]>,
}

impl PartitionWriter<'_> {
    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn recent(&self, player: &str) -> Result<Option<RankRecord>, StoreError> {
        read_record(&self.recent, &player_key(player))
    }

    pub fn best(&self, player: &str) -> Result<Option<RankRecord>, StoreError> {
        read_record(&self.best, &player_key(player))
    }

    pub fn put_recent(&mut self, record: &RankRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.recent.insert(record.player_key().as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn put_best(&mut self, record: &RankRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.best.insert(record.player_key().as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn window(&self) -> Result<Option<CollectionWindow>, StoreError> {
        read_window(&self.metadata)
    }

    /// `end` always moves to `run_at`; `start` is written only once.
    pub fn mark_window(&mut self, run_at: i64) -> Result<(), StoreError> {
        let stamp = encode_timestamp(run_at);
        if read_timestamp(&self.metadata, META_START)?.is_none() {
            self.metadata.insert(META_START, stamp.as_slice())?;
        }
        self.metadata.insert(META_END, stamp.as_slice())?;
        Ok(())
    }
}

/// redb-backed store holding `recent`, `best` and `metadata` tables per partition.
#[derive(Clone)]
pub struct RankStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RankStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankStore").finish_non_exhaustive()
    }
}

impl RankStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `apply` against one partition in a single write transaction.
    ///
    /// Commits only when `apply` returns `Ok`; any error aborts, leaving the
    /// partition exactly as it was. Tables are created on first commit.
    pub fn write_partition<T, E, F>(&self, key: PartitionKey, apply: F) -> Result<T, E>
    where
        F: FnOnce(&mut PartitionWriter<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(StoreError::from)?;
        let names = TableNames::for_partition(key);
        let outcome = {
            let mut writer = PartitionWriter {
                key,
                recent: txn.open_table(table_def(&names.recent)).map_err(StoreError::from)?,
                best: txn.open_table(table_def(&names.best)).map_err(StoreError::from)?,
                metadata: txn.open_table(table_def(&names.metadata)).map_err(StoreError::from)?,
            };
            apply(&mut writer)
        };

        match outcome {
            Ok(value) => {
                txn.commit().map_err(StoreError::from)?;
                debug!(partition = %key, "partition transaction committed");
                Ok(value)
            }
            Err(err) => {
                txn.abort().map_err(StoreError::from)?;
                debug!(partition = %key, "partition transaction aborted");
                Err(err)
            }
        }
    }

    /// Snapshot read of one player. `None` when any of the partition's tables is missing.
    pub fn read_player(&self, key: PartitionKey, name: &str) -> Result<Option<PlayerView>, StoreError> {
        let txn = self.db.begin_read()?;
        let names = TableNames::for_partition(key);
        let recent = open_existing(&txn, &names.recent)?;
        let best = open_existing(&txn, &names.best)?;
        let metadata = open_existing(&txn, &names.metadata)?;
        let (Some(recent), Some(best), Some(metadata)) = (recent, best, metadata) else {
            return Ok(None);
        };

        let player = player_key(name);
        Ok(Some(PlayerView {
            recent: read_record(&recent, &player)?,
            best: read_record(&best, &player)?,
            window: read_window(&metadata)?,
        }))
    }
}

fn open_existing(
    txn: &ReadTransaction,
    name: &str,
) -> Result<Option<ReadOnlyTable<&'static str, &'static [u8]>>, StoreError> {
    match txn.open_table(table_def(name)) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Single-attempt HTTP GET client. Failures are returned to the caller, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str, floor: u32, minute: u32, second: u32, checked_time: i64) -> RankRecord {
        RankRecord {
            name: name.to_string(),
            floor,
            minute,
            second,
            checked_time,
            ..Default::default()
        }
    }

    #[test]
    fn timestamps_round_trip_big_endian() {
        let bytes = encode_timestamp(0x0102_0304_0506_0708);
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decode_timestamp("end", &bytes).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(decode_timestamp("start", &encode_timestamp(-1)).unwrap(), -1);
        assert!(matches!(
            decode_timestamp("start", &[0, 1, 2]),
            Err(StoreError::CorruptMetadata { len: 3, .. })
        ));
    }

    #[test]
    fn missing_partition_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = RankStore::open(dir.path().join("ranks.redb")).expect("open");
        assert_eq!(store.read_player(PartitionKey::new(1, 2), "alice").unwrap(), None);
    }

    #[test]
    fn committed_writes_are_visible_case_insensitively() {
        let dir = tempdir().expect("tempdir");
        let store = RankStore::open(dir.path().join("ranks.redb")).expect("open");
        let key = PartitionKey::new(1, 2);

        store
            .write_partition(key, |w| -> Result<(), StoreError> {
                let rec = record("Alice", 15, 3, 20, 100);
                w.put_recent(&rec)?;
                w.put_best(&rec)?;
                w.mark_window(100)
            })
            .unwrap();

        let view = store.read_player(key, "ALICE").unwrap().expect("partition");
        assert_eq!(view.recent.as_ref().map(|r| r.floor), Some(15));
        assert_eq!(view.best, view.recent);
        assert_eq!(view.window, Some(CollectionWindow { start: 100, end: 100 }));

        let other = store.read_player(PartitionKey::new(12, 2), "alice").unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn failed_apply_aborts_everything() {
        let dir = tempdir().expect("tempdir");
        let store = RankStore::open(dir.path().join("ranks.redb")).expect("open");
        let key = PartitionKey::new(1, 2);

        let result = store.write_partition(key, |w| -> anyhow::Result<()> {
            w.put_recent(&record("Bob", 3, 1, 0, 50))?;
            w.mark_window(50)?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(store.read_player(key, "bob").unwrap(), None);
    }

    #[test]
    fn window_start_is_written_once() {
        let dir = tempdir().expect("tempdir");
        let store = RankStore::open(dir.path().join("ranks.redb")).expect("open");
        let key = PartitionKey::new(1, 2);

        for ts in [100, 250] {
            store.write_partition(key, |w| w.mark_window(ts)).unwrap();
        }

        let window = store.write_partition(key, |w| w.window()).unwrap();
        assert_eq!(window, Some(CollectionWindow { start: 100, end: 250 }));
    }
}

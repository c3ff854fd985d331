//! Dead-letter store backed by `sled`
//!
//! Records are kept in one tree per destination (topic or queue name). Each
//! key is prefixed with the record timestamp so iteration yields records in
//! chronological order and TTL cleanup can work from the key alone.
//!
//! Configuration options supported:
//! - `ttl_seconds`: records older than this are removed during `load`
//! - `max_records_per_source`: cap per tree; the oldest records are removed
//!   when it is exceeded

use sled::Db;
use tracing::warn;
use uuid::Uuid;

use crate::config::PersistenceSettings;
use crate::persistence::{DeadLetterRecord, DeadLetterSink};
use crate::utils::error::Result;

#[derive(Clone)]
pub struct SledDeadLetterStore {
    db: Db,
    ttl_seconds: Option<i64>,
    max_records_per_source: Option<usize>,
}

impl SledDeadLetterStore {
    /// Open or create a sled database at `path` with the given retention policy.
    pub fn new(
        path: &str,
        ttl_seconds: Option<i64>,
        max_records_per_source: Option<usize>,
    ) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_records_per_source,
        })
    }

    /// Open the store described by `settings`, if a path is configured.
    pub fn from_settings(settings: &PersistenceSettings) -> Result<Option<Self>> {
        settings
            .dead_letter_path
            .as_deref()
            .map(|path| Self::new(path, settings.ttl_seconds, settings.max_records_per_source))
            .transpose()
    }

    /// Load the records stored for `source`, honoring the TTL.
    pub fn load(&self, source: &str) -> Result<Vec<DeadLetterRecord>> {
        self.cleanup_old_records(source)?;
        let tree = self.db.open_tree(source)?;

        Ok(tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect())
    }

    pub fn len(&self, source: &str) -> Result<usize> {
        Ok(self.db.open_tree(source)?.len())
    }

    fn trim(&self, tree: &sled::Tree, source: &str) {
        let Some(max) = self.max_records_per_source else {
            return;
        };
        let total = tree.len();
        if total <= max {
            return;
        }

        let keys_to_delete: Vec<_> = tree
            .iter()
            .take(total - max)
            .filter_map(|entry| entry.ok().map(|(k, _)| k))
            .collect();

        for key in keys_to_delete {
            if let Err(e) = tree.remove(key) {
                warn!(source, error = %e, "failed to trim dead-letter record");
            }
        }
    }

    fn cleanup_old_records(&self, source: &str) -> Result<()> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let expiry_time = chrono::Utc::now().timestamp_millis() - ttl * 1000;

        let tree = self.db.open_tree(source)?;
        let old_keys: Vec<_> = tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, _)| {
                let ts = std::str::from_utf8(&key)
                    .ok()?
                    .split_once('_')?
                    .0
                    .parse::<i64>()
                    .ok()?;
                (ts < expiry_time).then_some(key)
            })
            .collect();

        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

impl DeadLetterSink for SledDeadLetterStore {
    fn store(&self, record: &DeadLetterRecord) -> Result<()> {
        let source = record.message.destination.as_str();
        let serialized = serde_json::to_vec(record)?;
        let tree = self.db.open_tree(source)?;

        let key = format!("{:020}_{}", record.recorded_at, Uuid::new_v4());
        tree.insert(key.as_bytes(), serialized)?;

        self.trim(&tree, source);
        Ok(())
    }
}

impl std::fmt::Debug for SledDeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledDeadLetterStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_records_per_source", &self.max_records_per_source)
            .finish()
    }
}

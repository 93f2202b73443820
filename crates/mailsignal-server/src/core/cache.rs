use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mailsignal_proto::MetadataRecord;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("metadata cache unavailable: {0}")]
    Unavailable(String),
}

/// Maps message ids to the recipient metadata first seen for them.
///
/// `put_many` must report a key as new to exactly one caller even when
/// several batches race on it.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    /// Stores every record and returns the ids that were absent before.
    ///
    /// A known id keeps its cached fields unless the new record carries
    /// them too.
    async fn put_many(
        &self,
        records: HashMap<String, MetadataRecord>
    ) -> Result<HashSet<String>, CacheError>;

    /// Returns the subset of `ids` currently cached.
    async fn get_many(
        &self,
        ids: &[String]
    ) -> Result<HashMap<String, MetadataRecord>, CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: MetadataRecord,
    updated_at: Instant,
}

/// Process-local cache. Not shared between instances, so a multi-instance
/// deployment needs an external store behind [`MetadataCache`].
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drops entries not refreshed within the ttl and returns how many went.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.updated_at) <= self.ttl);
        before.saturating_sub(entries.len())
    }

    fn is_live(
        &self,
        entry: &CacheEntry,
        now: Instant
    ) -> bool {
        now.duration_since(entry.updated_at) <= self.ttl
    }
}

#[async_trait]
impl MetadataCache for MemoryCache {
    async fn put_many(
        &self,
        records: HashMap<String, MetadataRecord>
    ) -> Result<HashSet<String>, CacheError> {
        if records.is_empty() {
            return Ok(HashSet::new());
        }

        // One write guard for the whole batch keeps the "new" report exact.
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let mut fresh = HashSet::new();

        for (message_id, record) in records {
            let known = entries
                .get(&message_id)
                .is_some_and(|entry| self.is_live(entry, now));
            if !known {
                fresh.insert(message_id.clone());
                entries.insert(message_id, CacheEntry { record, updated_at: now });
            } else if let Some(entry) = entries.get_mut(&message_id) {
                entry.record.overlay(record);
                entry.updated_at = now;
            }
        }

        Ok(fresh)
    }

    async fn get_many(
        &self,
        ids: &[String]
    ) -> Result<HashMap<String, MetadataRecord>, CacheError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(ids
            .iter()
            .filter_map(|id| {
                entries
                    .get(id)
                    .filter(|entry| self.is_live(entry, now))
                    .map(|entry| (id.clone(), entry.record.clone()))
            })
            .collect())
    }
}

/// Periodically removes expired cache entries until shutdown.
pub async fn run_cache_pruner(
    cache: Arc<MemoryCache>,
    every: Duration,
    shutdown: CancellationToken
) {
    let mut ticker = interval(every);
    info!(
        "cache pruner started: every={}, ttl={}",
        humantime::format_duration(every),
        humantime::format_duration(cache.ttl)
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("cache pruner stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = cache.prune_expired().await;
                if removed > 0 {
                    debug!(
                        "pruned stale message mappings: removed={}, tracked={}",
                        removed,
                        cache.len().await
                    );
                }
            }
        }
    }
}

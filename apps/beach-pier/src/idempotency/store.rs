use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::debug;

use super::coordinator::IdempotencyRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("idempotency store is full ({capacity} live keys)")]
    CapacityExhausted { capacity: usize },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Backing collection for accepted idempotency keys.
///
/// `insert_if_absent` must be a single indivisible check-and-insert: when several
/// callers race on one key, exactly one of them observes `true`.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Record `record.key` unless a live record already holds it. Returns whether it was inserted.
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, StoreError>;

    /// Drop every record.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Number of records currently held (expired-but-unpurged records may be included).
    async fn len(&self) -> Result<usize, StoreError>;

    /// Drop records whose retention window has passed; returns how many were dropped.
    /// Stores that expire records on their own keep the default.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

struct StoredKey {
    accepted_at: DateTime<Utc>,
    expires_at: Option<Instant>,
}

impl StoredKey {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-process store with an optional retention window and key cap.
///
/// Expired records are reclaimed by [`MemoryKeyStore::purge_expired_at`], normally
/// from the task started by [`IdempotencyCoordinator::spawn_purger`]. The cap is never
/// enforced by evicting live keys: when it is reached, new keys are refused with
/// `CapacityExhausted` until a purge frees room.
///
/// [`IdempotencyCoordinator::spawn_purger`]: super::IdempotencyCoordinator::spawn_purger
pub struct MemoryKeyStore {
    entries: DashMap<String, StoredKey>,
    retention: Option<Duration>,
    max_keys: Option<usize>,
}

impl MemoryKeyStore {
    pub fn new(retention: Option<Duration>, max_keys: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
            max_keys,
        }
    }

    /// Keys are kept forever and without bound.
    pub fn unbounded() -> Self {
        Self::new(None, None)
    }

    fn insert_at(&self, record: &IdempotencyRecord, now: Instant) -> Result<bool, StoreError> {
        if let Some(capacity) = self.max_keys {
            // Approximate under contention: concurrent first-time inserts may overshoot by a few.
            if self.entries.len() >= capacity && !self.entries.contains_key(&record.key) {
                return Err(StoreError::CapacityExhausted { capacity });
            }
        }

        let stored = StoredKey {
            accepted_at: record.accepted_at,
            expires_at: self.retention.map(|ttl| now + ttl),
        };

        // The entry guard holds the shard write lock across the check and the insert.
        match self.entries.entry(record.key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    debug!(
                        key = %record.key,
                        previously_accepted_at = %entry.get().accepted_at,
                        "idempotency key expired; accepting again"
                    );
                    entry.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(stored);
                Ok(true)
            }
        }
    }

    /// Remove expired records; returns how many were dropped.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        if self.retention.is_none() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        self.insert_at(record, Instant::now())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.purge_expired_at(Instant::now()))
    }
}

/// Redis-backed store for coordinators spread across processes.
///
/// Acceptance is a single `SET key value NX [EX ttl]`, which Redis executes atomically.
/// Reconnects are handled by the `ConnectionManager`.
#[derive(Clone)]
pub struct RedisKeyStore {
    redis: ConnectionManager,
    prefix: String,
    retention: Option<Duration>,
}

impl RedisKeyStore {
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        retention: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::with_manager(redis, prefix, retention))
    }

    pub fn with_manager(
        redis: ConnectionManager,
        prefix: impl Into<String>,
        retention: Option<Duration>,
    ) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            retention,
        }
    }

    fn redis_key(&self, key: &str) -> String {
        redis_key(&self.prefix, key)
    }

    async fn scan_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", escape_glob(&self.prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500u32)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl KeyStore for RedisKeyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.redis_key(&record.key))
            .arg(record.accepted_at.to_rfc3339())
            .arg("NX");
        if let Some(ttl) = self.retention {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        // `OK` when set, nil when the key already existed.
        let reply: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let keys = self.scan_keys().await?;
        let mut conn = self.redis.clone();
        for chunk in keys.chunks(500) {
            conn.del::<_, ()>(chunk).await?;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.scan_keys().await?.len())
    }
}

fn redis_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

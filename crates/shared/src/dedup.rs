//! Best-effort dedup cache for inbound webhook bodies
//!
//! Obviously-duplicate delivery payloads are short-circuited here before they
//! reach the ledger. The cache is never the source of truth: every error is
//! reported to the caller as a `DedupCacheError` so it can be logged and
//! ignored, and the ledger's own uniqueness constraints still decide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

const KEY_PREFIX: &str = "lead-delivery:dedup:";

/// Upper bound on in-memory entries before expired ones are swept
const MAX_IN_MEMORY_ENTRIES: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum DedupCacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Clone)]
struct CachedBody {
    value: String,
    stored_at: Instant,
}

/// Short-TTL key-value cache keyed by payload fingerprint
#[derive(Clone)]
pub enum DedupCache {
    Redis {
        connection: ConnectionManager,
        ttl: Duration,
    },
    InMemory {
        entries: Arc<RwLock<HashMap<String, CachedBody>>>,
        ttl: Duration,
    },
    Disabled,
}

impl DedupCache {
    /// Connect to Redis and build a cache backed by it
    pub async fn connect_redis(redis_url: &str, ttl: Duration) -> Result<Self, DedupCacheError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::Redis { connection, ttl })
    }

    pub fn new_in_memory(ttl: Duration) -> Self {
        Self::InMemory {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn disabled() -> Self {
        Self::Disabled
    }

    /// Look up a previously stored response for this fingerprint
    pub async fn get(&self, fingerprint: &str) -> Result<Option<String>, DedupCacheError> {
        match self {
            Self::Redis { connection, .. } => {
                let mut conn = connection.clone();
                let value: Option<String> = conn.get(format!("{KEY_PREFIX}{fingerprint}")).await?;
                Ok(value)
            }
            Self::InMemory { entries, ttl } => {
                let entries = entries.read().await;
                Ok(entries
                    .get(fingerprint)
                    .filter(|cached| cached.stored_at.elapsed() < *ttl)
                    .map(|cached| cached.value.clone()))
            }
            Self::Disabled => Ok(None),
        }
    }

    /// Store a response for this fingerprint. The first writer wins.
    pub async fn put(&self, fingerprint: &str, value: &str) -> Result<(), DedupCacheError> {
        match self {
            Self::Redis { connection, ttl } => {
                let mut conn = connection.clone();
                let _: Option<String> = redis::cmd("SET")
                    .arg(format!("{KEY_PREFIX}{fingerprint}"))
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Self::InMemory { entries, ttl } => {
                let mut entries = entries.write().await;
                if entries.len() >= MAX_IN_MEMORY_ENTRIES {
                    entries.retain(|_, cached| cached.stored_at.elapsed() < *ttl);
                }
                let fresh = entries
                    .get(fingerprint)
                    .is_some_and(|cached| cached.stored_at.elapsed() < *ttl);
                if !fresh {
                    entries.insert(
                        fingerprint.to_string(),
                        CachedBody {
                            value: value.to_string(),
                            stored_at: Instant::now(),
                        },
                    );
                }
                Ok(())
            }
            Self::Disabled => Ok(()),
        }
    }
}

/// Hex SHA-256 of a raw request body
pub fn payload_fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

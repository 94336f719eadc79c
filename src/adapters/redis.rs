//! Redis Adapters
//!
//! One Redis deployment serves as the shared L2 store, the lock service and
//! the pub/sub bus.
//!
//! # Key layout
//!
//! ```text
//! {namespace}:{cache}::{key}        cached value (JSON CachedValue), PX ttl
//! {namespace}:lock:{lock name}     lock token, NX PX lease
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, error, info};

use crate::cache::core::Backends;
use crate::cache::entry::CachedValue;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{DistributedLock, EventChannel, LockLease, RemoteStore};
use crate::error::{Error, Result};

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "meshcache";

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 500;

/// Poll interval while waiting for a lock
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Compare-and-delete so only the holder releases its lock
const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

fn unavailable(e: redis::RedisError) -> Error {
    Error::RemoteStoreUnavailable(e.to_string())
}

/// Escape glob metacharacters for SCAN MATCH
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis implementation of all three ports
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
    namespace: String,
}

impl RedisBackend {
    /// Connect to `url` using the default namespace
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_namespace(url, DEFAULT_NAMESPACE).await
    }

    pub async fn connect_with_namespace(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(namespace = %namespace, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            namespace: namespace.to_string(),
        })
    }

    /// Port handles backed by this connection
    pub fn backends(&self) -> Backends {
        let backend = std::sync::Arc::new(self.clone());
        Backends {
            store: backend.clone(),
            lock: backend.clone(),
            channel: backend,
        }
    }

    fn cache_prefix(&self, cache: &str) -> String {
        format!("{}:{}::", self.namespace, cache)
    }

    fn data_key(&self, cache: &str, key: &str) -> String {
        format!("{}{}", self.cache_prefix(cache), key)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.namespace, name)
    }

    fn encode(value: &CachedValue) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(raw: Option<String>) -> Result<Option<CachedValue>> {
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Error::from)
    }

    fn set_cmd(key: &str, value: String, ttl: Duration) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd
    }

    /// Full data keys of one cache
    async fn scan_cache(&self, cache: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(&self.cache_prefix(cache)));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

// =============================================================================
// Remote Store
// =============================================================================

#[async_trait]
impl RemoteStore for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CachedValue>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.data_key(cache, key))
            .await
            .map_err(unavailable)?;
        Self::decode(raw)
    }

    async fn put(&self, cache: &str, key: &str, value: CachedValue, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = Self::set_cmd(&self.data_key(cache, key), Self::encode(&value)?, ttl)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn remove(&self, cache: &str, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .del(self.data_key(cache, key))
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn clear(&self, cache: &str) -> Result<u64> {
        let keys = self.scan_cache(cache).await?;
        let mut conn = self.conn.clone();
        let mut removed = 0;
        for chunk in keys.chunks(SCAN_COUNT) {
            let n: u64 = conn.del(chunk).await.map_err(unavailable)?;
            removed += n;
        }
        debug!(cache = %cache, removed, "Cleared Redis keys");
        Ok(removed)
    }

    async fn get_all(&self, cache: &str, keys: &[String]) -> Result<HashMap<String, CachedValue>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let data_keys: Vec<String> = keys.iter().map(|k| self.data_key(cache, k)).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&data_keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut found = HashMap::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(raw) {
            if let Some(value) = Self::decode(raw)? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn put_all(
        &self,
        cache: &str,
        entries: &[(String, CachedValue)],
        ttl: Duration,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.add_command(Self::set_cmd(&self.data_key(cache, key), Self::encode(value)?, ttl))
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn remove_all(&self, cache: &str, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let data_keys: Vec<String> = keys.iter().map(|k| self.data_key(cache, k)).collect();
        let mut conn = self.conn.clone();
        conn.del(data_keys).await.map_err(unavailable)
    }

    async fn keys(&self, cache: &str) -> Result<Vec<String>> {
        let prefix = self.cache_prefix(cache);
        Ok(self
            .scan_cache(cache)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn size(&self, cache: &str) -> Result<u64> {
        Ok(self.scan_cache(cache).await?.len() as u64)
    }

    async fn expire(&self, cache: &str, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.data_key(cache, key))
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(updated == 1)
    }
}

// =============================================================================
// Distributed Lock
// =============================================================================

#[async_trait]
impl DistributedLock for RedisBackend {
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease_time: Duration,
    ) -> Result<Option<LockLease>> {
        let lease = LockLease::new(name);
        let key = self.lock_key(name);
        let deadline = Instant::now() + wait;
        let mut conn = self.conn.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&lease.token)
                .arg("NX")
                .arg("PX")
                .arg(lease_time.as_millis().max(1) as u64)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if acquired.is_some() {
                return Ok(Some(lease));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(LOCK_RETRY_INTERVAL)).await;
        }
    }

    async fn unlock(&self, lease: &LockLease) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(self.lock_key(&lease.name))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

// =============================================================================
// Event Channel
// =============================================================================

#[async_trait]
impl EventChannel for RedisBackend {
    async fn publish(&self, topic: &str, event: &CacheEvent) -> Result<()> {
        let frame = event.encode()?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, frame)
            .await
            .map_err(|e| Error::EventPublish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, CacheEvent>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!(topic = %topic, "Subscribed to cache events");

        let topic = topic.to_string();
        Ok(pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let topic = topic.clone();
                async move {
                    let decoded = msg
                        .get_payload::<String>()
                        .map_err(Error::from)
                        .and_then(|raw| CacheEvent::decode(&raw));
                    match decoded {
                        Ok(event) => Some(event),
                        Err(e) => {
                            error!(topic = %topic, error = %e, "Dropping undecodable cache event");
                            None
                        }
                    }
                }
            })
            .boxed())
    }
}

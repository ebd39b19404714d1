// Presence directory: user id -> live connection handle, with expiry
//
// Presence is a cache, not a source of truth. The directory is polymorphic
// over two interchangeable backends: a Redis store shared with other
// processes, and an in-process map used when Redis is not configured or not
// reachable. All access goes through the directory; callers never touch the
// backing map.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Default binding lifetime, refreshed on every bind.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(3600);

/// Backend contract: three point operations plus the guarded unbind used on
/// connection teardown.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Register `user_id` as reachable at `handle`, overwriting any prior
    /// binding (second login evicts the first mapping).
    async fn bind(&self, user_id: i64, handle: &str, ttl: Duration) -> Result<(), String>;

    /// Current unexpired binding, if any. Absence is a normal outcome.
    async fn lookup(&self, user_id: i64) -> Result<Option<String>, String>;

    /// Remove the binding unconditionally. No-op if absent.
    async fn unbind(&self, user_id: i64) -> Result<(), String>;

    /// Remove the binding only while it still equals `handle`, so a delayed
    /// disconnect cannot clear a newer connection's binding.
    async fn unbind_handle(&self, user_id: i64, handle: &str) -> Result<(), String>;
}

/// In-process presence map with lazy TTL expiry.
pub struct MemoryPresence {
    bindings: RwLock<HashMap<i64, (String, Instant)>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn bind(&self, user_id: i64, handle: &str, ttl: Duration) -> Result<(), String> {
        let mut bindings = self.bindings.write().await;
        bindings.insert(user_id, (handle.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn lookup(&self, user_id: i64) -> Result<Option<String>, String> {
        {
            let bindings = self.bindings.read().await;
            match bindings.get(&user_id) {
                Some((handle, expires_at)) if *expires_at > Instant::now() => {
                    return Ok(Some(handle.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired entry: drop it under the write lock.
        let mut bindings = self.bindings.write().await;
        if let Some((_, expires_at)) = bindings.get(&user_id) {
            if *expires_at <= Instant::now() {
                bindings.remove(&user_id);
            }
        }
        Ok(None)
    }

    async fn unbind(&self, user_id: i64) -> Result<(), String> {
        let mut bindings = self.bindings.write().await;
        bindings.remove(&user_id);
        Ok(())
    }

    async fn unbind_handle(&self, user_id: i64, handle: &str) -> Result<(), String> {
        let mut bindings = self.bindings.write().await;
        if let Some((current, _)) = bindings.get(&user_id) {
            if current == handle {
                bindings.remove(&user_id);
            }
        }
        Ok(())
    }
}

/// Redis-backed presence store, shared across server restarts.
pub struct RedisPresence {
    manager: Mutex<ConnectionManager>,
}

// Compare-and-delete so unbind on a stale handle is a no-op.
const UNBIND_HANDLE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl RedisPresence {
    pub async fn connect(redis_url: &str) -> Result<Self, String> {
        let client = redis::Client::open(redis_url).map_err(|e| e.to_string())?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            manager: Mutex::new(manager),
        })
    }

    fn key(user_id: i64) -> String {
        format!("presence:user:{}", user_id)
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn bind(&self, user_id: i64, handle: &str, ttl: Duration) -> Result<(), String> {
        let mut conn = self.manager.lock().await;
        conn.set_ex::<_, _, ()>(Self::key(user_id), handle, ttl.as_secs())
            .await
            .map_err(|e| e.to_string())
    }

    async fn lookup(&self, user_id: i64) -> Result<Option<String>, String> {
        let mut conn = self.manager.lock().await;
        conn.get::<_, Option<String>>(Self::key(user_id))
            .await
            .map_err(|e| e.to_string())
    }

    async fn unbind(&self, user_id: i64) -> Result<(), String> {
        let mut conn = self.manager.lock().await;
        conn.del::<_, ()>(Self::key(user_id))
            .await
            .map_err(|e| e.to_string())
    }

    async fn unbind_handle(&self, user_id: i64, handle: &str) -> Result<(), String> {
        let mut conn = self.manager.lock().await;
        let result: Result<(), redis::RedisError> = redis::Script::new(UNBIND_HANDLE_SCRIPT)
            .key(Self::key(user_id))
            .arg(handle)
            .invoke_async(&mut *conn)
            .await;
        result.map_err(|e| e.to_string())
    }
}

/// The presence directory the rest of the server talks to.
///
/// Applies the best-effort policy on top of whichever backend it wraps:
/// bind/unbind failures are logged and swallowed, lookup failures read as
/// "offline". Presence must never block message persistence.
#[derive(Clone)]
pub struct PresenceDirectory {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
}

impl PresenceDirectory {
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPresence::new()), DEFAULT_PRESENCE_TTL)
    }

    /// Connect to Redis if a URL is given, falling back to the in-process map
    /// when Redis is unreachable.
    pub async fn connect(redis_url: Option<&str>, ttl: Duration) -> Self {
        match redis_url {
            Some(url) => match RedisPresence::connect(url).await {
                Ok(store) => {
                    tracing::info!("Presence directory backed by Redis at {}", url);
                    Self::new(Arc::new(store), ttl)
                }
                Err(e) => {
                    tracing::warn!("Redis unreachable ({}), using in-memory presence", e);
                    Self::new(Arc::new(MemoryPresence::new()), ttl)
                }
            },
            None => {
                tracing::info!("Presence directory using in-memory store");
                Self::new(Arc::new(MemoryPresence::new()), ttl)
            }
        }
    }

    pub async fn bind(&self, user_id: i64, handle: &str) {
        if let Err(e) = self.store.bind(user_id, handle, self.ttl).await {
            tracing::error!("Failed to bind presence for user {}: {}", user_id, e);
        }
    }

    /// Fail-open: a store failure reads as offline, never as a crash.
    pub async fn lookup(&self, user_id: i64) -> Option<String> {
        match self.store.lookup(user_id).await {
            Ok(binding) => binding,
            Err(e) => {
                tracing::error!("Presence lookup failed for user {}: {}", user_id, e);
                None
            }
        }
    }

    pub async fn unbind(&self, user_id: i64) {
        if let Err(e) = self.store.unbind(user_id).await {
            tracing::error!("Failed to unbind presence for user {}: {}", user_id, e);
        }
    }

    /// Guarded unbind used on connection teardown.
    pub async fn unbind_handle(&self, user_id: i64, handle: &str) {
        if let Err(e) = self.store.unbind_handle(user_id, handle).await {
            tracing::error!(
                "Failed to unbind presence for user {} (handle {}): {}",
                user_id,
                handle,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that fails every operation, for the fail-open paths.
    struct BrokenPresence;

    #[async_trait]
    impl PresenceStore for BrokenPresence {
        async fn bind(&self, _: i64, _: &str, _: Duration) -> Result<(), String> {
            Err("store down".into())
        }
        async fn lookup(&self, _: i64) -> Result<Option<String>, String> {
            Err("store down".into())
        }
        async fn unbind(&self, _: i64) -> Result<(), String> {
            Err("store down".into())
        }
        async fn unbind_handle(&self, _: i64, _: &str) -> Result<(), String> {
            Err("store down".into())
        }
    }

    #[tokio::test]
    async fn test_bind_lookup_unbind_roundtrip() {
        let directory = PresenceDirectory::in_memory();

        assert_eq!(directory.lookup(1).await, None);

        directory.bind(1, "conn-a").await;
        assert_eq!(directory.lookup(1).await, Some("conn-a".to_string()));

        directory.unbind(1).await;
        assert_eq!(directory.lookup(1).await, None);
    }

    #[tokio::test]
    async fn test_second_bind_evicts_first() {
        let directory = PresenceDirectory::in_memory();

        directory.bind(1, "conn-a").await;
        directory.bind(1, "conn-b").await;

        assert_eq!(directory.lookup(1).await, Some("conn-b".to_string()));
    }

    #[tokio::test]
    async fn test_unbind_handle_ignores_stale_handle() {
        let directory = PresenceDirectory::in_memory();

        directory.bind(1, "conn-a").await;
        directory.bind(1, "conn-b").await;

        // Connection A's delayed disconnect must not clear B's binding.
        directory.unbind_handle(1, "conn-a").await;
        assert_eq!(directory.lookup(1).await, Some("conn-b".to_string()));

        directory.unbind_handle(1, "conn-b").await;
        assert_eq!(directory.lookup(1).await, None);
    }

    #[tokio::test]
    async fn test_memory_binding_expires() {
        let directory = PresenceDirectory::new(
            Arc::new(MemoryPresence::new()),
            Duration::from_millis(50),
        );

        directory.bind(1, "conn-a").await;
        assert_eq!(directory.lookup(1).await, Some("conn-a".to_string()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(directory.lookup(1).await, None);
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_offline() {
        let directory =
            PresenceDirectory::new(Arc::new(BrokenPresence), DEFAULT_PRESENCE_TTL);

        // None of these may panic or surface the failure.
        directory.bind(1, "conn-a").await;
        assert_eq!(directory.lookup(1).await, None);
        directory.unbind(1).await;
        directory.unbind_handle(1, "conn-a").await;
    }
}

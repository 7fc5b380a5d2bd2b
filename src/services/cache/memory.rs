use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::services::cache::client::{CacheClient, CacheResult};

/// Process-local cache with the same TTL semantics as the Valkey client.
/// Used in tests and single-process local runs.
#[derive(Clone, Debug, Default)]
pub struct MemoryCacheClient {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryCacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<T>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        f(&mut entries)
    }
}

#[async_trait]
impl CacheClient for MemoryCacheClient {
    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.with_live(|m| m.get(key).map(|(v, _)| v.clone())))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let expires_at = Instant::now() + ttl;
        self.with_live(|m| m.insert(key.to_string(), (value.to_string(), expires_at)));
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> CacheResult<bool> {
        Ok(self.with_live(|m| match m.get(key) {
            Some((v, _)) if v == expected => m.remove(key).is_some(),
            _ => false,
        }))
    }
}

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{CacheError, SessionCache};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`SessionCache`]. Expiry follows tokio's clock, so tests can
/// drive it with `tokio::time::pause` and `advance`.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let current = match entries.get(key) {
            Some(e) if e.is_live(now) => Some(
                e.value
                    .parse::<u64>()
                    .map_err(|e| CacheError::Backend(format!("counter {key} is not an integer: {e}")))?,
            ),
            _ => None,
        };
        match current {
            Some(n) => {
                let count = n + 1;
                if let Some(e) = entries.get_mut(key) {
                    e.value = count.to_string();
                }
                Ok(count)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: now + window,
                    },
                );
                Ok(1)
            }
        }
    }
}

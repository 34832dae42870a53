//! Ephemeral session cache. Entries are accelerants backed by the credential
//! store; absence is a normal outcome. The one exception is the revocation
//! marker, which exists only here and gates a revocation link.

use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("cache backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Atomically increment `key`. The expiry is set only by the increment
    /// that creates the key, so a running window is never extended.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, CacheError>;
}

/// Cache key layout.
pub mod keys {
    use uuid::Uuid;

    pub fn refresh_token(email: &str, device: &str) -> String {
        format!("refresh:{email}:{device}")
    }

    /// Prefix covering every device's refresh entry for one email.
    pub fn refresh_token_prefix(email: &str) -> String {
        format!("refresh:{email}:")
    }

    pub fn profile(user_id: Uuid) -> String {
        format!("user:{user_id}")
    }

    pub fn login_attempt(identifier: &str) -> String {
        format!("login_attempt:{identifier}")
    }

    pub fn revocation(email: &str) -> String {
        format!("revoke:{email}")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn refresh_prefix_covers_device_keys() {
            let key = refresh_token("alice@example.com", "windows_chrome");
            assert_eq!(key, "refresh:alice@example.com:windows_chrome");
            assert!(key.starts_with(&refresh_token_prefix("alice@example.com")));
            assert!(!key.starts_with(&refresh_token_prefix("alice@example.co")));
        }
    }
}

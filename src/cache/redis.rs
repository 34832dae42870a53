use std::time::Duration;

use ::redis::{aio::MultiplexedConnection, AsyncCommands, Client, Script};
use anyhow::Context;
use async_trait::async_trait;
use lazy_static::lazy_static;
use tracing::debug;

use super::{CacheError, SessionCache};

lazy_static! {
    // INCR and PEXPIRE run as one script so a crash between them can never
    // leave a counter without a TTL.
    static ref INCR_WITH_EXPIRY: Script = Script::new(
        r#"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        return count
        "#,
    );
}

/// Redis-backed [`SessionCache`].
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url).context("parse redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;
        Ok(Self { conn })
    }
}

/// Escape glob metacharacters so SCAN MATCH treats the prefix literally.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl SessionCache for RedisCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys: Vec<String> = Vec::new();
        {
            let mut conn = self.conn.clone();
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(&keys).await?;
        debug!(%prefix, removed, "redis prefix delete");
        Ok(removed)
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis().max(1) as u64;
        let count: u64 = INCR_WITH_EXPIRY
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

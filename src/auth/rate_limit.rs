use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::cache::{keys, CacheError, SessionCache};

/// Fixed-window attempt counter backed by the session cache.
///
/// The window starts at the first attempt and is not extended by later ones.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn SessionCache>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn SessionCache>, limit: u64, window: Duration) -> Self {
        Self {
            cache,
            limit,
            window,
        }
    }

    /// Count one attempt for `identifier`; `false` once the limit is exceeded.
    pub async fn allow(&self, identifier: &str) -> Result<bool, CacheError> {
        let count = self
            .cache
            .increment_with_expiry(&keys::login_attempt(identifier), self.window)
            .await?;
        debug!(identifier, count, limit = self.limit, "rate limit attempt");
        Ok(count <= self.limit)
    }
}

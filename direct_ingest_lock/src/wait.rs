//! Bounded polling for locks that are expected to free up.

use observability_deps::tracing::info;
use std::{future::Future, time::Duration};

use crate::{Error, Result};

/// How long to keep polling for a lock before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWaitConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl LockWaitConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(4 * 60 * 60);
}

impl Default for LockWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_wait: Self::DEFAULT_MAX_WAIT,
        }
    }
}

/// Calls `attempt` until it yields a value, sleeping `poll_interval` between
/// attempts. Fails with [`Error::Timeout`] naming `description` once
/// `max_wait` has elapsed.
pub async fn poll_until<F, Fut, T>(config: LockWaitConfig, description: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Send,
{
    let mut waited = Duration::ZERO;
    loop {
        if let Some(value) = attempt().await? {
            return Ok(value);
        }
        if waited >= config.max_wait {
            return Err(Error::Timeout {
                description: description.to_string(),
                waited_secs: waited.as_secs(),
            });
        }
        info!(
            description,
            waited_secs = waited.as_secs(),
            poll_interval_secs = config.poll_interval.as_secs(),
            "waiting for lock"
        );
        tokio::time::sleep(config.poll_interval).await;
        waited += config.poll_interval;
    }
}

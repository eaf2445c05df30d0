//! Machine-wide token bucket for executor invocations.
//!
//! The bucket lives in a [`StateStore`], so every coordinator process on
//! the machine draws from the same budget. A token is taken before a
//! worker is spawned and is never handed back; the bucket refills with
//! time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::state::StateStore;
use crate::{tlog_debug, Error, Result};

/// Persisted bucket. A missing `last_refill` means a full bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: Option<DateTime<Utc>>,
    #[serde(default)]
    pub granted: u64,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, per_sec: f64, now: DateTime<Utc>) {
        match self.last_refill {
            None => self.tokens = capacity,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO).as_secs_f64();
                self.tokens = (self.tokens + elapsed * per_sec).min(capacity);
            }
        }
        self.last_refill = Some(now);
    }

    /// Take one token, or report how long until one is available.
    pub fn take(&mut self, capacity: f64, per_sec: f64, now: DateTime<Utc>) -> std::result::Result<(), Duration> {
        self.refill(capacity, per_sec, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.granted += 1;
            return Ok(());
        }
        if per_sec <= 0.0 {
            return Err(Duration::from_secs(1));
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / per_sec))
    }
}

pub struct RateLimiter {
    store: Arc<StateStore<BucketState>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(store: Arc<StateStore<BucketState>>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            capacity: f64::from(config.capacity.max(1)),
            refill_per_sec: config.refill_per_sec.max(0.0),
        }
    }

    /// One attempt. `ResourceExhausted` when the bucket is empty.
    pub async fn try_acquire(&self) -> Result<()> {
        let (capacity, per_sec) = (self.capacity, self.refill_per_sec);
        self.store
            .update(move |bucket| bucket.take(capacity, per_sec, Utc::now()))
            .await?
            .map_err(|wait| Error::ResourceExhausted(format!("rate limit; next token in {:?}", wait)))
    }

    /// Wait for a token. Admission waits, it never fails for lack of tokens.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let (capacity, per_sec) = (self.capacity, self.refill_per_sec);
            let wait = match self
                .store
                .update(move |bucket| bucket.take(capacity, per_sec, Utc::now()))
                .await?
            {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tlog_debug!("Rate limited; waiting {:?}", wait);
            let wait = wait.clamp(Duration::from_millis(10), Duration::from_secs(5));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    pub async fn snapshot(&self) -> Result<BucketState> {
        self.store.snapshot().await
    }
}

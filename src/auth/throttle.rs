//! Login throttling for the local provider.
//!
//! Failed attempts INCR a windowed counter; reaching the limit swaps
//! the counter for a lockout key whose TTL drives `Retry-After`.
//! Throttling is disabled when any knob is zero.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::redis_key;
use crate::error::KvError;
use crate::kv::Kv;

/// Throttle knobs from the local provider config.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub max_attempts: i64,
    #[serde(default)]
    pub window_seconds: i64,
    #[serde(default)]
    pub lockout_seconds: i64,
}

impl ThrottleConfig {
    pub fn enabled(&self) -> bool {
        self.max_attempts > 0 && self.window_seconds > 0 && self.lockout_seconds > 0
    }
}

#[derive(Clone)]
pub struct LoginThrottle {
    kv: Arc<dyn Kv>,
    prefix: String,
}

impl LoginThrottle {
    pub fn new(kv: Arc<dyn Kv>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_string(),
        }
    }

    fn normalize(subject: &str) -> String {
        subject.trim().to_lowercase()
    }

    fn attempts_key(&self, subject: &str) -> String {
        redis_key(&self.prefix, &["auth", "local", "attempts", subject])
    }

    fn lockout_key(&self, subject: &str) -> String {
        redis_key(&self.prefix, &["auth", "local", "lockout", subject])
    }

    /// Remaining lockout TTL in seconds, or 0 when not locked.
    pub async fn check_lockout(&self, subject: &str) -> Result<i64, KvError> {
        let subject = Self::normalize(subject);
        let ttl = self.kv.ttl(&self.lockout_key(&subject)).await?;
        Ok(ttl.max(0))
    }

    /// Record a failure. Returns `(locked, metric)`: the lockout TTL
    /// when the limit was reached, otherwise the attempts remaining.
    pub async fn record_failure(
        &self,
        subject: &str,
        config: &ThrottleConfig,
    ) -> Result<(bool, i64), KvError> {
        if !config.enabled() {
            return Ok((false, config.max_attempts));
        }
        let subject = Self::normalize(subject);
        let attempts_key = self.attempts_key(&subject);
        let attempts = self.kv.incr(&attempts_key).await?;
        self.kv.expire(&attempts_key, config.window_seconds).await?;

        if attempts >= config.max_attempts {
            self.kv.del(&attempts_key).await?;
            let lockout_key = self.lockout_key(&subject);
            self.kv
                .set_ex(&lockout_key, "1", config.lockout_seconds)
                .await?;
            let ttl = self.kv.ttl(&lockout_key).await?;
            let ttl = if ttl > 0 { ttl } else { config.lockout_seconds };
            return Ok((true, ttl));
        }
        Ok((false, (config.max_attempts - attempts).max(0)))
    }

    /// Clear both keys after a successful login.
    pub async fn reset(&self, subject: &str) -> Result<(), KvError> {
        let subject = Self::normalize(subject);
        self.kv.del(&self.attempts_key(&subject)).await?;
        self.kv.del(&self.lockout_key(&subject)).await?;
        Ok(())
    }
}

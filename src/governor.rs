//! Gatekeeping for upstream crawls.
//!
//! [`Governor`] owns two pieces of shared state: a semaphore capping
//! concurrent collections and a per-`(server, keyword)` map of the earliest
//! instant the next crawl may start. Rate-limit backoff windows live in the
//! same map so a throttled key is blocked for both the collector and the
//! search path. Neither check ever waits.

use metrics::increment_counter;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tracing::{info, warn};

use crate::util::random_between;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub fn sample(&self) -> Duration {
        random_between(self.min, self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(15 * 60),
            max: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorPolicy {
    pub max_concurrency: usize,
    pub cooldown: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            cooldown: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Refusal {
    #[error("maximum concurrent collections reached")]
    Busy,
    #[error("collected recently, {}s until next attempt", .remaining.as_secs())]
    Cooldown { remaining: Duration },
    #[error("backing off after upstream rate limit, {}s remaining", .remaining.as_secs())]
    BackingOff { remaining: Duration },
}

impl Refusal {
    #[must_use]
    pub const fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Busy => None,
            Self::Cooldown { remaining } | Self::BackingOff { remaining } => Some(*remaining),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyState {
    not_before: Instant,
    backoff: bool,
}

/// Held for the duration of one collection; releases the slot on drop.
#[derive(Debug)]
pub struct CrawlPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct Governor {
    policy: GovernorPolicy,
    permits: Arc<Semaphore>,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl Governor {
    #[must_use]
    pub fn new(policy: GovernorPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(policy.max_concurrency.max(1))),
            policy,
            keys: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &GovernorPolicy {
        &self.policy
    }

    /// Checks the key's cooldown/backoff, then takes a concurrency slot.
    pub fn try_begin(&self, key: &str) -> Result<CrawlPermit, Refusal> {
        if let Some(refusal) = self.blocked(key) {
            increment_counter!("vending_collect_refused", "reason" => refusal_label(&refusal));
            return Err(refusal);
        }

        let permit = Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            increment_counter!("vending_collect_refused", "reason" => "busy");
            Refusal::Busy
        })?;

        Ok(CrawlPermit { _permit: permit })
    }

    /// Records a completed crawl; the key cools down from now.
    pub fn finish(&self, key: &str) {
        let until = Instant::now() + self.policy.cooldown;
        self.extend(key, until, false);
    }

    /// Installs a randomized backoff window for the key and returns its length.
    pub fn record_rate_limited(&self, key: &str) -> Duration {
        let window = self.policy.backoff.sample();
        self.extend(key, Instant::now() + window, true);
        increment_counter!("vending_backoff_installed");
        warn!(key, backoff_secs = window.as_secs(), "installed rate-limit backoff");
        window
    }

    /// Time left on the key's rate-limit backoff, if one is active.
    #[must_use]
    pub fn backoff_remaining(&self, key: &str) -> Option<Duration> {
        match self.blocked(key) {
            Some(Refusal::BackingOff { remaining }) => Some(remaining),
            _ => None,
        }
    }

    /// Collections currently holding a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.policy
            .max_concurrency
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }

    /// Drops keys whose windows have passed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let before = keys.len();
        keys.retain(|_, state| state.not_before > now);
        let removed = before - keys.len();
        if removed > 0 {
            info!(removed, "pruned expired crawl cooldowns");
        }
        removed
    }

    fn blocked(&self, key: &str) -> Option<Refusal> {
        let now = Instant::now();
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let state = keys.get(key)?;
        if state.not_before <= now {
            return None;
        }

        let remaining = state.not_before - now;
        Some(if state.backoff {
            Refusal::BackingOff { remaining }
        } else {
            Refusal::Cooldown { remaining }
        })
    }

    // never shortens an existing window
    fn extend(&self, key: &str, until: Instant, backoff: bool) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let state = keys.entry(key.to_string()).or_insert(KeyState {
            not_before: until,
            backoff,
        });
        if until >= state.not_before {
            state.not_before = until;
            state.backoff = backoff;
        }
    }
}

const fn refusal_label(refusal: &Refusal) -> &'static str {
    match refusal {
        Refusal::Busy => "busy",
        Refusal::Cooldown { .. } => "cooldown",
        Refusal::BackingOff { .. } => "backoff",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_concurrency: usize) -> Governor {
        Governor::new(GovernorPolicy {
            max_concurrency,
            cooldown: Duration::from_secs(60),
            backoff: BackoffPolicy {
                min: Duration::from_secs(15 * 60),
                max: Duration::from_secs(60 * 60),
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_rejects_immediately() {
        let governor = governor(2);

        let first = governor.try_begin("baphomet|a").unwrap();
        let _second = governor.try_begin("baphomet|b").unwrap();
        assert_eq!(governor.try_begin("baphomet|c").unwrap_err(), Refusal::Busy);
        assert_eq!(governor.active(), 2);

        drop(first);
        assert!(governor.try_begin("baphomet|c").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_after_finish() {
        let governor = governor(2);

        drop(governor.try_begin("ifrit|apple").unwrap());
        governor.finish("ifrit|apple");

        let refusal = governor.try_begin("ifrit|apple").unwrap_err();
        assert!(matches!(refusal, Refusal::Cooldown { .. }));
        assert!(governor.try_begin("ifrit|banana").is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(governor.try_begin("ifrit|apple").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_blocks_until_window_passes() {
        let governor = governor(2);

        let window = governor.record_rate_limited("ifrit|apple");
        assert!(window >= Duration::from_secs(15 * 60));
        assert!(window <= Duration::from_secs(60 * 60));
        assert!(governor.backoff_remaining("ifrit|apple").is_some());

        // a plain cooldown must not shorten the backoff
        governor.finish("ifrit|apple");
        assert!(matches!(
            governor.try_begin("ifrit|apple").unwrap_err(),
            Refusal::BackingOff { .. }
        ));

        tokio::time::advance(window + Duration::from_secs(1)).await;
        assert!(governor.backoff_remaining("ifrit|apple").is_none());
        assert!(governor.try_begin("ifrit|apple").is_ok());
        assert_eq!(governor.prune(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_elapsed_keys() {
        let governor = governor(1);
        governor.finish("a");
        governor.finish("b");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(governor.prune(), 2);
    }
}

//! Per-key request coalescing (singleflight).
//!
//! The first caller for a key becomes the leader and runs the work. Callers
//! arriving while it runs subscribe to the leader's result instead of doing
//! the work again. The in-flight marker is removed when the leader finishes,
//! fails, or is dropped, so the next caller after that leads again.

use metrics::increment_counter;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::upstream::FetchError;

type Outcome<T> = Result<T, FetchError>;

#[derive(Debug)]
pub struct Coalescer<T> {
    in_flight: Mutex<HashMap<String, broadcast::Sender<Outcome<T>>>>,
}

impl<T: Clone> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Coalescer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `work` unless another caller is already running it for `key`, in
    /// which case waits for and returns that caller's outcome.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let follower = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(key).map(broadcast::Sender::subscribe) {
                Some(rx) => Some(rx),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = follower {
            increment_counter!("vending_coalesced_waits");
            debug!(key, "joining in-flight fetch");
            // a closed channel means the leader was dropped mid-flight
            return rx.recv().await.unwrap_or(Err(FetchError::Abandoned));
        }

        let mut guard = LeaderGuard {
            coalescer: self,
            key,
            done: false,
        };
        let outcome = work().await;
        guard.complete(&outcome);
        outcome
    }

    /// Keys with a fetch currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take(&self, key: &str) -> Option<broadcast::Sender<Outcome<T>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

struct LeaderGuard<'a, T: Clone> {
    coalescer: &'a Coalescer<T>,
    key: &'a str,
    done: bool,
}

impl<T: Clone> LeaderGuard<'_, T> {
    fn complete(&mut self, outcome: &Outcome<T>) {
        self.done = true;
        if let Some(tx) = self.coalescer.take(self.key) {
            // no subscribers is fine
            let _ = tx.send(outcome.clone());
        }
    }
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.coalescer.take(self.key);
        }
    }
}

//! Deduplication of concurrent identical operations.
//!
//! A `SingleFlight` group runs at most one operation per key at a time. Callers
//! arriving while an operation for their key is in flight wait for it and
//! receive a clone of its output. The key is retired as soon as the operation
//! finishes, so a later call, including a retry after a failure, starts fresh.
//!
//! An operation is driven by the callers waiting on it. Once the last of them
//! is dropped the operation is dropped with it and its key retired, so an
//! abandoned run never holds on to the resources it acquired.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, trace};

type Call<T> = Shared<BoxFuture<'static, T>>;

struct Entry<T: Clone> {
    call: Call<T>,
    waiters: usize,
}

/// Group of in-flight operations producing `T`, keyed by string
pub struct SingleFlight<T: Clone> {
    calls: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless a run is already in flight, then return
    /// that run's output
    ///
    /// `make` is only invoked by the caller that starts a run. The output,
    /// error or not, is handed unchanged to every waiter.
    pub async fn work<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut waiter = {
            let mut calls = self.lock();
            if calls.contains_key(key) {
                trace!(key = %key, "Joining in-flight call");
            }
            let entry = calls.entry(key.to_string()).or_insert_with(|| Entry {
                call: make().boxed().shared(),
                waiters: 0,
            });
            entry.waiters += 1;
            Waiter {
                group: self,
                key: key.to_string(),
                call: entry.call.clone(),
                done: false,
            }
        };

        let output = waiter.call.clone().await;
        waiter.done = true;
        output
    }

    /// Number of keys with a run in flight
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One caller's stake in a run
///
/// Dropping it after the run finished retires the key. Dropping it before
/// removes the caller, and the last caller to leave cancels the run.
struct Waiter<'a, T: Clone + Send + Sync + 'static> {
    group: &'a SingleFlight<T>,
    key: String,
    call: Call<T>,
    done: bool,
}

impl<T: Clone + Send + Sync + 'static> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        let removed = {
            let mut calls = self.group.lock();
            // A newer run may already own the key
            let Some(entry) = calls
                .get_mut(&self.key)
                .filter(|entry| Shared::ptr_eq(&entry.call, &self.call))
            else {
                return;
            };
            entry.waiters -= 1;
            if self.done || entry.waiters == 0 {
                if !self.done {
                    debug!(key = %self.key, "Cancelling abandoned call");
                }
                calls.remove(&self.key)
            } else {
                None
            }
        };
        // The run itself is dropped outside the lock
        drop(removed);
    }
}

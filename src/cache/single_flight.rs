//! Collapses concurrent identical fetches into one backend call.
//!
//! Both cache decorators key their misses through a [`SingleFlight`] table:
//! the first task to miss becomes the leader and runs the loader; tasks that
//! miss the same key while the fetch is in flight subscribe and receive the
//! leader's result, success or failure alike. The slot exists only for the
//! duration of the fetch, so a later call after an error retries cleanly.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::ReadError;

type Slot = broadcast::Sender<Result<Bytes, ReadError>>;

/// At-most-one-in-flight coordinator over keys of type `K`.
pub struct SingleFlight<K> {
    pending: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Run `loader` for `key`, unless a fetch for the same key is already in
    /// flight, in which case wait for and share its result.
    ///
    /// The loader runs on the calling task. If that task is cancelled before
    /// the loader completes, the slot is removed and every waiter receives
    /// [`ReadError::Cancelled`]; the next call for the key starts over.
    pub async fn run<F, Fut>(&self, key: K, loader: F) -> Result<Bytes, ReadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, ReadError>>,
    {
        let existing = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    pending.insert(key.clone(), tx);
                    None
                }
            }
        };

        let mut rx = match existing {
            Some(rx) => rx,
            None => return self.lead(key, loader).await,
        };

        match rx.recv().await {
            Ok(result) => result,
            // The leader went away without publishing.
            Err(_) => Err(ReadError::Cancelled(
                "in-flight fetch was abandoned".to_string(),
            )),
        }
    }

    async fn lead<F, Fut>(&self, key: K, loader: F) -> Result<Bytes, ReadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, ReadError>>,
    {
        // Removes the slot even when the loader future is dropped mid-flight,
        // which closes the channel and wakes every waiter.
        let mut guard = SlotGuard {
            pending: &self.pending,
            key: Some(key),
        };

        let result = loader().await;

        if let Some(tx) = guard.take_slot() {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

struct SlotGuard<'a, K: Eq + Hash + Clone> {
    pending: &'a Mutex<HashMap<K, Slot>>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> SlotGuard<'_, K> {
    /// Remove the slot and hand back its sender for publishing. Once the
    /// entry is gone, new callers for the key become leaders themselves.
    fn take_slot(&mut self) -> Option<Slot> {
        let key = self.key.take()?;
        self.pending.lock().unwrap().remove(&key)
    }
}

impl<K: Eq + Hash + Clone> Drop for SlotGuard<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.pending.lock().unwrap().remove(&key);
        }
    }
}

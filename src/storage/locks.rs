//! Per-request exclusive sections for the in-process store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per request id, created on first use.
///
/// Holding the guard returned by [`RequestLocks::acquire`] serializes the
/// whole read, mutate, evaluate sequence on that request. Requests do not
/// contend with each other.
#[derive(Debug, Default)]
pub struct RequestLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the request's section and returns its guard.
    pub async fn acquire(&self, request_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(request_id)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Number of requests that have had a section opened.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

//! Store sync controller.
//!
//! Sits between session actors and a [`SessionStore`]:
//!
//! - **Writes** are queued and coalesced. Every mutation queues the full
//!   record; a background flusher waits a short window, then writes only the
//!   newest queued version per session. A burst of ten mutations becomes one
//!   store write.
//! - **Reads** (`rehydrate`) tolerate replica lag. If the caller knows a
//!   version was written, older or missing reads are retried with
//!   exponential backoff until the expected version shows up or the budget
//!   runs out.
//!
//! Failed writes are re-queued (unless a newer version was queued in the
//! meantime) and retried after `write_retry_delay`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dicehall_protocol::SessionId;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{SessionStore, StoreError, Versioned};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Exponential backoff for stale reads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total read attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Each subsequent delay is multiplied by this.
    pub multiplier: u32,
    /// Delays never exceed this.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            multiplier: 2,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Settings for [`StoreSync`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    /// How long the flusher waits after the first queued write before
    /// writing, so later mutations in the same burst coalesce.
    pub coalesce_window: Duration,
    /// Pause before re-attempting writes that failed.
    pub write_retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            coalesce_window: Duration::from_millis(50),
            write_retry_delay: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum PendingOp<R> {
    Put(R),
    Delete,
}

#[derive(Debug)]
struct Shared<R> {
    pending: Mutex<HashMap<SessionId, PendingOp<R>>>,
    /// Last version this process successfully wrote, per session.
    written: Mutex<HashMap<SessionId, u64>>,
    wake: Notify,
    /// Serializes write passes so an older batch never lands after a newer one.
    pass: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: Versioned> Shared<R> {
    fn requeue(&self, id: SessionId, op: PendingOp<R>) {
        // A newer queued op wins over the one that failed.
        lock(&self.pending).entry(id).or_insert(op);
    }

    async fn write_pass<S: SessionStore<R>>(&self, store: &S) -> Result<usize, StoreError> {
        let _pass = self.pass.lock().await;
        let batch: Vec<(SessionId, PendingOp<R>)> = lock(&self.pending).drain().collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut first_error = None;
        for (id, op) in batch {
            let result = match &op {
                PendingOp::Put(record) => store.put(record.clone()).await,
                PendingOp::Delete => store.delete(id).await,
            };
            match result {
                Ok(()) => {
                    written += 1;
                    let mut versions = lock(&self.written);
                    match &op {
                        PendingOp::Put(record) => {
                            let v = versions.entry(id).or_insert(0);
                            *v = (*v).max(record.version());
                        }
                        PendingOp::Delete => {
                            versions.remove(&id);
                        }
                    }
                }
                Err(e) => {
                    warn!(session = %id, error = %e, "store write failed, requeueing");
                    self.requeue(id, op);
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(written, "store write pass complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreSync
// ---------------------------------------------------------------------------

/// Coalescing writer and lag-tolerant reader over a [`SessionStore`].
///
/// Must be created inside a Tokio runtime: construction spawns the
/// background flusher. Call [`close`](Self::close) before dropping to write
/// out anything still queued.
#[derive(Debug)]
pub struct StoreSync<S, R> {
    store: Arc<S>,
    config: SyncConfig,
    shared: Arc<Shared<R>>,
    flusher: JoinHandle<()>,
}

impl<S, R> StoreSync<S, R>
where
    S: SessionStore<R>,
    R: Versioned,
{
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            pass: tokio::sync::Mutex::new(()),
        });

        let flusher = tokio::spawn(run_flusher(
            Arc::clone(&store),
            Arc::clone(&shared),
            config.clone(),
        ));

        Self {
            store,
            config,
            shared,
            flusher,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Queues `record` for writing.
    ///
    /// Replaces any queued older version of the same session. A queued
    /// newer version is kept and `record` is ignored. Returns `true` if the
    /// write coalesced with one already queued.
    pub fn queue_write(&self, record: R) -> bool {
        let id = record.key();
        let coalesced = {
            let mut pending = lock(&self.shared.pending);
            match pending.get(&id) {
                Some(PendingOp::Put(queued)) if queued.version() > record.version() => {
                    debug!(session = %id, "ignoring write older than queued version");
                    return true;
                }
                Some(_) => {
                    pending.insert(id, PendingOp::Put(record));
                    true
                }
                None => {
                    pending.insert(id, PendingOp::Put(record));
                    false
                }
            }
        };
        self.shared.wake.notify_one();
        coalesced
    }

    /// Queues a delete of `id`, superseding any queued write.
    pub fn queue_delete(&self, id: SessionId) {
        lock(&self.shared.pending).insert(id, PendingOp::Delete);
        self.shared.wake.notify_one();
    }

    /// Number of sessions with queued operations.
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Last version this process wrote for `id`, if any.
    pub fn written_version(&self, id: SessionId) -> Option<u64> {
        lock(&self.shared.written).get(&id).copied()
    }

    /// Writes everything queued now, without waiting for the flusher.
    ///
    /// # Errors
    /// Returns the first write error; failed entries stay queued.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        self.shared.write_pass(self.store.as_ref()).await
    }

    /// Flushes and stops the background flusher.
    pub async fn close(&self) -> Result<usize, StoreError> {
        let result = self.flush().await;
        self.flusher.abort();
        result
    }

    /// Loads the record for `id`.
    ///
    /// A version still queued locally is returned without touching the
    /// store. Otherwise the store is read until it returns at least
    /// `expected_version` (or at least the last version this process
    /// wrote, whichever is higher).
    ///
    /// # Errors
    /// - [`StoreError::NotFound`] if the store has nothing and no version
    ///   is expected.
    /// - [`StoreError::Stale`] if the expected version never appeared
    ///   within the retry budget.
    /// - [`StoreError::Backend`] if the store kept failing.
    pub async fn rehydrate(
        &self,
        id: SessionId,
        expected_version: Option<u64>,
    ) -> Result<R, StoreError> {
        match lock(&self.shared.pending).get(&id) {
            Some(PendingOp::Put(record))
                if record.version() >= expected_version.unwrap_or(0) =>
            {
                return Ok(record.clone());
            }
            Some(PendingOp::Delete) => return Err(StoreError::NotFound(id)),
            _ => {}
        }

        let floor = match (expected_version, self.written_version(id)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let policy = &self.config.retry;
        let attempts = policy.max_attempts.max(1);
        let mut found = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.get(id).await {
                Ok(Some(record)) => {
                    if floor.is_none_or(|f| record.version() >= f) {
                        if attempt > 1 {
                            debug!(session = %id, attempt, "rehydrate caught up");
                        }
                        return Ok(record);
                    }
                    found = Some(record.version());
                    last_error = None;
                }
                Ok(None) if floor.is_none() => return Err(StoreError::NotFound(id)),
                Ok(None) => {
                    found = None;
                    last_error = None;
                }
                Err(e) => last_error = Some(e),
            }

            if attempt < attempts {
                let delay = policy.delay_after(attempt);
                debug!(
                    session = %id,
                    attempt,
                    ?floor,
                    ?found,
                    delay_ms = delay.as_millis() as u64,
                    "stale read, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        if let Some(e) = last_error {
            warn!(session = %id, error = %e, "rehydrate gave up on backend errors");
            return Err(e);
        }

        let expected = floor.unwrap_or_default();
        warn!(session = %id, expected, ?found, "rehydrate gave up on stale reads");
        Err(StoreError::Stale {
            id,
            expected,
            found,
            attempts,
        })
    }
}

impl<S, R> Drop for StoreSync<S, R> {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

async fn run_flusher<S, R>(store: Arc<S>, shared: Arc<Shared<R>>, config: SyncConfig)
where
    S: SessionStore<R>,
    R: Versioned,
{
    loop {
        shared.wake.notified().await;
        if !config.coalesce_window.is_zero() {
            tokio::time::sleep(config.coalesce_window).await;
        }
        if shared.write_pass(store.as_ref()).await.is_err() {
            tokio::time::sleep(config.write_retry_delay).await;
            shared.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_after_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            multiplier: 2,
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(2), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(300));
        assert_eq!(policy.delay_after(30), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_after_zero_multiplier_is_constant() {
        let policy = RetryPolicy {
            multiplier: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(3), policy.base_delay);
    }
}

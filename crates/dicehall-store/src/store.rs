//! The session store adapter: durable key-value access to session records.
//!
//! [`SessionStore`] is the seam to whatever replicated database a
//! deployment uses. Implementations may lag: a read right after a write
//! can return an older version or nothing at all. Callers never talk to a
//! store directly; they go through [`StoreSync`](crate::StoreSync), which
//! owns the retry policy for that lag.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use dicehall_protocol::SessionId;
use tokio::time::Instant;

use crate::StoreError;

/// A record the store can hold: keyed by session and versioned.
pub trait Versioned: Clone + Send + Sync + 'static {
    /// The session this record belongs to.
    fn key(&self) -> SessionId;

    /// Monotonically increasing version, bumped on every mutation.
    fn version(&self) -> u64;
}

/// Durable, possibly eventually-consistent, key-value access to session
/// records.
///
/// Methods return `Send` futures so the store can be driven from spawned
/// tasks (the background flusher).
pub trait SessionStore<R: Versioned>: Send + Sync + 'static {
    /// Reads the latest visible record for `id`.
    fn get(
        &self,
        id: SessionId,
    ) -> impl Future<Output = Result<Option<R>, StoreError>> + Send;

    /// Writes `record` under `record.key()`.
    fn put(&self, record: R) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes the record for `id`. Deleting a missing record is not an error.
    fn delete(&self, id: SessionId) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Revision<R> {
    visible_at: Instant,
    /// `None` is a tombstone.
    value: Option<R>,
}

/// In-process [`SessionStore`] with optional simulated replica lag.
///
/// With a non-zero `lag`, a write only becomes visible to readers `lag`
/// after it was made, the way a read replica trails its primary. Time is
/// Tokio time, so paused-clock tests control visibility exactly.
#[derive(Debug)]
pub struct MemoryStore<R> {
    lag: Duration,
    records: Mutex<HashMap<SessionId, Vec<Revision<R>>>>,
}

impl<R: Versioned> MemoryStore<R> {
    /// A store where writes are visible immediately.
    pub fn new() -> Self {
        Self::with_lag(Duration::ZERO)
    }

    /// A store whose reads trail writes by `lag`.
    pub fn with_lag(lag: Duration) -> Self {
        Self {
            lag,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, id: SessionId, value: Option<R>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".into()))?;
        let history = records.entry(id).or_default();

        // Drop revisions already shadowed by a newer visible one.
        if let Some(last_visible) = history.iter().rposition(|r| r.visible_at <= now) {
            history.drain(..last_visible);
        }
        history.push(Revision {
            visible_at: now + self.lag,
            value,
        });
        Ok(())
    }
}

impl<R: Versioned> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Versioned> SessionStore<R> for MemoryStore<R> {
    async fn get(&self, id: SessionId) -> Result<Option<R>, StoreError> {
        let now = Instant::now();
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".into()))?;
        Ok(records.get(&id).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|r| r.visible_at <= now)
                .and_then(|r| r.value.clone())
        }))
    }

    async fn put(&self, record: R) -> Result<(), StoreError> {
        self.push(record.key(), Some(record))
    }

    async fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        self.push(id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec {
        id: u64,
        version: u64,
    }

    impl Versioned for Rec {
        fn key(&self) -> SessionId {
            SessionId(self.id)
        }
        fn version(&self) -> u64 {
            self.version
        }
    }

    #[tokio::test]
    async fn test_put_then_get_without_lag() {
        let store = MemoryStore::new();
        store.put(Rec { id: 1, version: 1 }).await.unwrap();
        let got = store.get(SessionId(1)).await.unwrap();
        assert_eq!(got, Some(Rec { id: 1, version: 1 }));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store: MemoryStore<Rec> = MemoryStore::new();
        assert_eq!(store.get(SessionId(9)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_hides_record() {
        let store = MemoryStore::new();
        store.put(Rec { id: 1, version: 1 }).await.unwrap();
        store.delete(SessionId(1)).await.unwrap();
        assert_eq!(store.get(SessionId(1)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagged_write_invisible_until_lag_elapses() {
        let store = MemoryStore::with_lag(Duration::from_millis(100));
        store.put(Rec { id: 1, version: 1 }).await.unwrap();
        assert_eq!(store.get(SessionId(1)).await.unwrap(), None);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(store.get(SessionId(1)).await.unwrap().map(|r| r.version), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagged_update_serves_previous_version() {
        let store = MemoryStore::with_lag(Duration::from_millis(100));
        store.put(Rec { id: 1, version: 1 }).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        store.put(Rec { id: 1, version: 2 }).await.unwrap();
        assert_eq!(store.get(SessionId(1)).await.unwrap().map(|r| r.version), Some(1));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(store.get(SessionId(1)).await.unwrap().map(|r| r.version), Some(2));
    }
}

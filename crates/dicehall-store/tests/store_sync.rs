//! Integration tests for the store sync controller.
//!
//! Paused Tokio time drives both the coalescing window and the simulated
//! replica lag of `MemoryStore`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dicehall_protocol::SessionId;
use dicehall_store::{
    MemoryStore, RetryPolicy, SessionStore, StoreError, StoreSync, SyncConfig, Versioned,
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
struct Record {
    id: u64,
    version: u64,
}

impl Versioned for Record {
    fn key(&self) -> SessionId {
        SessionId(self.id)
    }
    fn version(&self) -> u64 {
        self.version
    }
}

fn rec(version: u64) -> Record {
    Record { id: 1, version }
}

/// Counts writes and can fail the first `fail_puts` of them.
struct InstrumentedStore {
    inner: MemoryStore<Record>,
    puts: AtomicUsize,
    fail_puts: AtomicUsize,
}

impl InstrumentedStore {
    fn new(lag: Duration) -> Self {
        Self {
            inner: MemoryStore::with_lag(lag),
            puts: AtomicUsize::new(0),
            fail_puts: AtomicUsize::new(0),
        }
    }

    fn failing(n: usize) -> Self {
        let store = Self::new(Duration::ZERO);
        store.fail_puts.store(n, Ordering::SeqCst);
        store
    }
}

impl SessionStore<Record> for InstrumentedStore {
    async fn get(&self, id: SessionId) -> Result<Option<Record>, StoreError> {
        self.inner.get(id).await
    }

    async fn put(&self, record: Record) -> Result<(), StoreError> {
        let remaining = self.fail_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_puts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(record).await
    }

    async fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            multiplier: 2,
            max_delay: Duration::from_millis(400),
        },
        coalesce_window: Duration::from_millis(50),
        write_retry_delay: Duration::from_millis(200),
    }
}

// =========================================================================
// Writes
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_write_burst_coalesces_into_one_put() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO));
    let sync = StoreSync::new(Arc::clone(&store), config());

    assert!(!sync.queue_write(rec(1)));
    assert!(sync.queue_write(rec(2)));
    assert!(sync.queue_write(rec(3)));

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(SessionId(1)).await.unwrap(), Some(rec(3)));
    assert_eq!(sync.written_version(SessionId(1)), Some(3));
    assert_eq!(sync.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_write_older_version_ignored() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO));
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(5));
    sync.queue_write(rec(4));
    sync.flush().await.unwrap();

    assert_eq!(store.get(SessionId(1)).await.unwrap(), Some(rec(5)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_requeued_and_retried() {
    let store = Arc::new(InstrumentedStore::failing(1));
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(1));
    let err = sync.flush().await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));
    assert_eq!(sync.pending_len(), 1, "failed write stays queued");

    assert_eq!(sync.flush().await.unwrap(), 1);
    assert_eq!(store.get(SessionId(1)).await.unwrap(), Some(rec(1)));
}

#[tokio::test(start_paused = true)]
async fn test_background_flusher_retries_failed_write() {
    let store = Arc::new(InstrumentedStore::failing(2));
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(1));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert_eq!(sync.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_writes_out_pending() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO));
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(7));
    sync.close().await.unwrap();

    assert_eq!(store.get(SessionId(1)).await.unwrap(), Some(rec(7)));
}

// =========================================================================
// Rehydrate
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_rehydrate_missing_without_expectation_is_not_found() {
    let store = Arc::new(MemoryStore::<Record>::new());
    let sync = StoreSync::new(store, config());

    let start = Instant::now();
    let err = sync.rehydrate(SessionId(1), None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(SessionId(1))));
    assert_eq!(start.elapsed(), Duration::ZERO, "no retries for plain misses");
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_retries_until_lagged_write_visible() {
    let store = Arc::new(MemoryStore::with_lag(Duration::from_millis(120)));
    let writer = StoreSync::new(Arc::clone(&store), config());
    let reader = StoreSync::new(Arc::clone(&store), config());

    writer.queue_write(rec(1));
    writer.flush().await.unwrap();

    let start = Instant::now();
    let got = reader.rehydrate(SessionId(1), Some(1)).await.unwrap();
    assert_eq!(got, rec(1));
    assert!(start.elapsed() >= Duration::from_millis(120));
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_skips_older_visible_version() {
    let store = Arc::new(MemoryStore::with_lag(Duration::from_millis(100)));
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(1));
    sync.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    sync.queue_write(rec(2));
    sync.flush().await.unwrap();

    // No explicit expectation: the version this process wrote is the floor.
    let got = sync.rehydrate(SessionId(1), None).await.unwrap();
    assert_eq!(got.version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_gives_up_as_stale() {
    let store = Arc::new(MemoryStore::with_lag(Duration::from_secs(3600)));
    let writer = StoreSync::new(Arc::clone(&store), config());
    let reader = StoreSync::new(Arc::clone(&store), config());

    writer.queue_write(rec(1));
    writer.flush().await.unwrap();

    let err = reader.rehydrate(SessionId(1), Some(1)).await.unwrap_err();
    assert!(err.is_transient());
    match err {
        StoreError::Stale {
            expected,
            found,
            attempts,
            ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(found, None);
            assert_eq!(attempts, 5);
        }
        other => panic!("expected Stale, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_prefers_queued_record() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO));
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(2));
    let got = sync.rehydrate(SessionId(1), Some(2)).await.unwrap();
    assert_eq!(got, rec(2));
    assert_eq!(store.puts.load(Ordering::SeqCst), 0, "served before any write");
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_after_queued_delete_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let sync = StoreSync::new(Arc::clone(&store), config());

    sync.queue_write(rec(1));
    sync.flush().await.unwrap();
    sync.queue_delete(SessionId(1));

    let err = sync.rehydrate(SessionId(1), None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    sync.flush().await.unwrap();
    assert_eq!(sync.written_version(SessionId(1)), None);
    assert_eq!(store.get(SessionId(1)).await.unwrap(), None);
}

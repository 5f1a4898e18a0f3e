//! Session persistence for Dicehall.
//!
//! - [`SessionStore`]: the adapter trait to a durable key-value store of
//!   versioned session records, with [`MemoryStore`] as the in-process
//!   implementation (optionally simulating replica lag).
//! - [`StoreSync`]: coalesces writes and retries lagging reads so callers
//!   never observe a version older than one they know was written.

mod error;
mod store;
mod sync;

pub use error::StoreError;
pub use store::{MemoryStore, SessionStore, Versioned};
pub use sync::{RetryPolicy, StoreSync, SyncConfig};

//! Backing stores for room snapshots.
//!
//! ```text
//! ┌──────────────┐  load / save   ┌─────────────────────┐
//! │ Room actor   │ ─────────────► │ dyn SnapshotStore   │
//! │ (persistence │                ├─────────────────────┤
//! │  bridge)     │                │ MemorySnapshotStore │  tests, dev
//! └──────────────┘                │ RocksSnapshotStore  │  CF "snapshots" (LZ4)
//!                                 │                     │  CF "metadata"  (bincode)
//!                                 └─────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{RocksSnapshotStore, RoomMetadata, StoreConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::persistence::{SnapshotStore, StoreError};

/// In-process store. Counts calls so tests can assert on save behavior.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshots: Mutex<HashMap<String, String>>,
    save_calls: AtomicU64,
    load_calls: AtomicU64,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a persisted payload for `room_id`.
    pub fn with_snapshot(self, room_id: &str, payload: impl Into<String>) -> Self {
        self.insert(room_id, payload);
        self
    }

    pub fn insert(&self, room_id: &str, payload: impl Into<String>) {
        self.inner.insert(room_id, payload.into());
    }

    pub fn get(&self, room_id: &str) -> Option<String> {
        self.inner.get(room_id)
    }

    /// Number of `save_snapshot` calls, including failed ones.
    pub fn save_calls(&self) -> u64 {
        self.inner.save_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> u64 {
        self.inner.load_calls.load(Ordering::SeqCst)
    }

    /// Make every save fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.inner.fail_saves.store(failing, Ordering::SeqCst);
    }

    /// Make every load fail with [`StoreError::Unavailable`].
    pub fn set_fail_loads(&self, failing: bool) {
        self.inner.fail_loads.store(failing, Ordering::SeqCst);
    }

    /// Delay every operation, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl MemoryInner {
    fn insert(&self, room_id: &str, payload: String) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(room_id.to_string(), payload);
    }

    fn get(&self, room_id: &str) -> Option<String> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.get(room_id).cloned()
    }

    async fn pause(&self) {
        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load_snapshot(&self, room_id: &str) -> BoxFuture<'static, Result<Option<String>, StoreError>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_string();
        Box::pin(async move {
            inner.load_calls.fetch_add(1, Ordering::SeqCst);
            inner.pause().await;
            if inner.fail_loads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("memory store set to fail loads".into()));
            }
            Ok(inner.get(&room_id))
        })
    }

    fn save_snapshot(&self, room_id: &str, payload: String) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_string();
        Box::pin(async move {
            inner.save_calls.fetch_add(1, Ordering::SeqCst);
            inner.pause().await;
            if inner.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("memory store set to fail saves".into()));
            }
            inner.insert(&room_id, payload);
            Ok(())
        })
    }
}

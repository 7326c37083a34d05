//! Lazy flushing of room state to the backing store.
//!
//! The bridge never writes on the edit path. A room marks itself dirty on
//! every document mutation; on each save interval (and on explicit or final
//! flushes) the room asks the bridge what to do:
//!
//! ```text
//! dirty? ──no──► Clean (nothing to do)
//!   │yes
//! save in flight? ──yes──► InFlight (retry on next tick)
//!   │no
//! export_all() empty? ──yes──► Empty (never overwrite with nothing)
//!   │no
//! Save(payload) ──► spawned store.save_snapshot() ──► SaveOutcome
//! ```
//!
//! A failed or timed-out save restores the dirty flag so the next interval
//! tries again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::document::ReplicatedDocument;

/// Backing-store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backing store timed out")]
    Timeout,
}

/// The durable store a room loads from and flushes to.
///
/// Payloads are the JSON text of a [`SnapshotPayload`](crate::document::SnapshotPayload).
/// Futures are `'static` so saves can run detached from the room task.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Last persisted payload for `room_id`, `None` if never saved.
    fn load_snapshot(&self, room_id: &str) -> BoxFuture<'static, Result<Option<String>, StoreError>>;

    /// Overwrite the persisted payload for `room_id`.
    fn save_snapshot(&self, room_id: &str, payload: String) -> BoxFuture<'static, Result<(), StoreError>>;
}

// ───────────────────────────────────────────────────────────────────
// Pending-save flag
// ───────────────────────────────────────────────────────────────────

/// Dirty flag plus last-mutation time, read and reset as one unit.
#[derive(Debug, Default)]
pub struct PendingSave {
    dirty: bool,
    last_mutation: Option<Instant>,
    in_flight: bool,
}

impl PendingSave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.last_mutation = Some(Instant::now());
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_mutation(&self) -> Option<Instant> {
        self.last_mutation
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Clear the flag, returning whether it was set.
    fn take(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

// ───────────────────────────────────────────────────────────────────
// Bridge
// ───────────────────────────────────────────────────────────────────

/// What a flush request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushDecision {
    /// Nothing changed since the last successful save.
    Clean,
    /// A save is already running; the flag stays set.
    InFlight,
    /// The document exports nothing; the store is left untouched.
    Empty,
    /// Persist this payload. The flag has been cleared and the save marked
    /// in flight; report back through [`PersistenceBridge::complete`].
    Save(String),
}

/// Result of one save attempt, delivered back to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub result: Result<(), StoreError>,
    pub elapsed: Duration,
}

pub struct PersistenceBridge {
    store: Arc<dyn SnapshotStore>,
    save_timeout: Duration,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn SnapshotStore>, save_timeout: Duration) -> Self {
        Self { store, save_timeout }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Decide whether to save. `force` skips the dirty check (final flush)
    /// but never the empty guard.
    pub fn prepare(
        &self,
        pending: &mut PendingSave,
        document: &ReplicatedDocument,
        force: bool,
    ) -> FlushDecision {
        if pending.in_flight {
            return FlushDecision::InFlight;
        }
        if !force && !pending.dirty {
            return FlushDecision::Clean;
        }

        let payload = document.export_all();
        if payload.is_empty() {
            log::debug!("Skipping save of empty document");
            return FlushDecision::Empty;
        }

        match payload.to_text() {
            Ok(text) => {
                pending.take();
                pending.in_flight = true;
                FlushDecision::Save(text)
            }
            Err(e) => {
                log::error!("Failed to serialize snapshot: {e}");
                FlushDecision::Clean
            }
        }
    }

    /// Run one bounded save. Safe to spawn: owns everything it touches.
    pub fn save(&self, room_id: &str, payload: String) -> BoxFuture<'static, SaveOutcome> {
        let fut = self.store.save_snapshot(room_id, payload);
        let limit = self.save_timeout;
        Box::pin(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };
            SaveOutcome { result, elapsed: started.elapsed() }
        })
    }

    /// Bounded load, used once when a room starts.
    pub async fn load(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        match tokio::time::timeout(self.save_timeout, self.store.load_snapshot(room_id)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Record a finished save. Failures re-arm the dirty flag.
    pub fn complete(&self, room_id: &str, pending: &mut PendingSave, outcome: &SaveOutcome) {
        pending.in_flight = false;
        match &outcome.result {
            Ok(()) => {
                log::debug!("Saved room {room_id} in {:?}", outcome.elapsed);
            }
            Err(e) => {
                pending.dirty = true;
                log::warn!("Save for room {room_id} failed after {:?}: {e}", outcome.elapsed);
            }
        }
    }
}

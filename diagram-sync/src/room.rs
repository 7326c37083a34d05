//! Room actor: one tokio task per live diagram.
//!
//! The actor owns the room's document, presence tracker, hub and
//! pending-save flag outright, so every mutation is serialized by the task
//! itself. Everything else talks to it through its command inbox.
//!
//! ```text
//!  UNINITIALIZED ──load ok──► ACTIVE ◄──────── join ────────┐
//!        │                     │                            │
//!    load failed           last socket left                 │
//!        │                     ▼                            │
//!        │                 DRAINING ── forced flush ────────┘
//!        │                     │
//!        │            flush done / timeout, inbox empty
//!        ▼                     ▼
//!    DESTROYED ◄───────────────┘
//! ```
//!
//! Retiring happens under the registry lock and only with an empty inbox.
//! Joins are sent while holding that same lock, so a join either reaches a
//! live actor or finds the room gone and starts a fresh one.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::codec::Message;
use crate::config::ServerConfig;
use crate::document::{DocumentError, ReplicatedDocument, SnapshotPayload};
use crate::hub::{ConnId, ConnectionHub, ControlFrame, HubStats, Outbox};
use crate::persistence::{FlushDecision, PendingSave, PersistenceBridge, SaveOutcome, StoreError};
use crate::presence::PresenceTracker;
use crate::registry::{lock_rooms, RoomMap};

/// External diagram id, taken from the WebSocket path.
pub type RoomId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomPhase {
    /// Loading the last snapshot; commands queue up.
    Uninitialized,
    Active,
    /// No sockets left; final flush in progress.
    Draining,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("snapshot load failed: {0}")]
    LoadFailed(StoreError),
    #[error("room closed")]
    Closed,
    #[error("unknown room: {0}")]
    UnknownRoom(String),
    #[error(transparent)]
    Edit(#[from] DocumentError),
}

/// Point-in-time view of a room, for observation and tests.
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub phase: RoomPhase,
    pub peers: usize,
    pub presence_entries: usize,
    pub dirty: bool,
    pub save_in_flight: bool,
    pub hub: HubStats,
    pub snapshot: SnapshotPayload,
}

pub(crate) enum RoomCommand {
    Join {
        conn: ConnId,
        outbox: Outbox,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Frame {
        conn: ConnId,
        data: Vec<u8>,
    },
    Control {
        conn: ConnId,
        frame: ControlFrame,
    },
    Leave {
        conn: ConnId,
    },
    Edit {
        namespace: String,
        id: String,
        value: Option<Value>,
        reply: oneshot::Sender<Result<bool, RoomError>>,
    },
    Save,
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
}

impl RoomCommand {
    /// Answer a command that will never be processed.
    fn reject(self, error: &RoomError) {
        match self {
            RoomCommand::Join { reply, .. } => {
                let _ = reply.send(Err(error.clone()));
            }
            RoomCommand::Edit { reply, .. } => {
                let _ = reply.send(Err(error.clone()));
            }
            _ => {}
        }
    }
}

/// Shared, read-only inputs of every room.
pub(crate) struct RoomContext {
    pub config: ServerConfig,
    pub bridge: PersistenceBridge,
    pub namespaces: Vec<String>,
}

struct Drain {
    deadline: Instant,
    flushed: bool,
    expired: bool,
}

pub(crate) struct RoomActor {
    id: RoomId,
    generation: u64,
    ctx: Arc<RoomContext>,
    rooms: RoomMap,
    inbox: mpsc::UnboundedReceiver<RoomCommand>,
    phase: watch::Sender<RoomPhase>,
    document: ReplicatedDocument,
    presence: PresenceTracker,
    hub: ConnectionHub,
    pending: PendingSave,
    saves_tx: mpsc::UnboundedSender<SaveOutcome>,
    saves_rx: mpsc::UnboundedReceiver<SaveOutcome>,
    drain: Option<Drain>,
}

impl RoomActor {
    pub(crate) fn new(
        id: RoomId,
        generation: u64,
        ctx: Arc<RoomContext>,
        rooms: RoomMap,
        inbox: mpsc::UnboundedReceiver<RoomCommand>,
        phase: watch::Sender<RoomPhase>,
    ) -> Self {
        let (saves_tx, saves_rx) = mpsc::unbounded_channel();
        let document = ReplicatedDocument::with_namespaces(ctx.namespaces.iter().cloned());
        Self {
            id,
            generation,
            ctx,
            rooms,
            inbox,
            phase,
            document,
            presence: PresenceTracker::new(),
            hub: ConnectionHub::new(),
            pending: PendingSave::new(),
            saves_tx,
            saves_rx,
            drain: None,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self.load().await {
            if self.ctx.config.start_empty_on_load_failure {
                log::warn!("Room {} starting empty after load failure: {e}", self.id);
            } else {
                log::error!("Room {} failed to load: {e}", self.id);
                self.abandon(RoomError::LoadFailed(e));
                return;
            }
        }
        self.set_phase(RoomPhase::Active);
        log::info!("Room {} active", self.id);

        let period = self.ctx.config.save_interval();
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.drain.as_ref().map(|d| d.deadline);
            tokio::select! {
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(outcome) = self.saves_rx.recv() => self.on_save_completed(outcome),
                _ = tick.tick() => self.on_tick(),
                _ = wait_until(deadline) => {
                    log::warn!("Room {} final flush timed out; tearing down", self.id);
                    if let Some(drain) = self.drain.as_mut() {
                        drain.expired = true;
                    }
                }
            }

            self.reap_dead();
            if self.hub.is_empty() && self.drain.is_none() {
                self.begin_drain();
            }
            if self.ready_to_retire() && self.try_retire() {
                break;
            }
        }

        self.set_phase(RoomPhase::Destroyed);
        log::info!("Room {} destroyed", self.id);
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    async fn load(&mut self) -> Result<(), StoreError> {
        let Some(text) = self.ctx.bridge.load(&self.id).await? else {
            log::debug!("Room {} has no snapshot", self.id);
            return Ok(());
        };
        let payload = SnapshotPayload::from_text(&text)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.document
            .import_all(&payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        log::info!("Room {} loaded {} entries", self.id, payload.entry_count());
        Ok(())
    }

    /// Give up before ever going active: unregister and fail queued commands.
    fn abandon(&mut self, error: RoomError) {
        let mut rooms = lock_rooms(&self.rooms);
        if rooms.get(&self.id).is_some_and(|h| h.generation == self.generation) {
            rooms.remove(&self.id);
        }
        // Nothing new can arrive once unregistered
        while let Ok(cmd) = self.inbox.try_recv() {
            cmd.reject(&error);
        }
        drop(rooms);
        self.set_phase(RoomPhase::Destroyed);
    }

    fn begin_drain(&mut self) {
        log::info!("Room {} draining", self.id);
        self.set_phase(RoomPhase::Draining);
        self.drain = Some(Drain {
            deadline: Instant::now() + self.ctx.config.final_flush_timeout(),
            flushed: false,
            expired: false,
        });
        self.advance_drain();
    }

    /// Start the forced flush once no other save is running.
    fn advance_drain(&mut self) {
        let waiting = matches!(&self.drain, Some(d) if !d.flushed);
        if !waiting || self.pending.in_flight() {
            return;
        }
        self.flush(true);
        if let Some(drain) = self.drain.as_mut() {
            drain.flushed = true;
        }
    }

    fn ready_to_retire(&self) -> bool {
        match &self.drain {
            Some(d) => d.expired || (d.flushed && !self.pending.in_flight()),
            None => false,
        }
    }

    /// Unregister if the inbox is empty. Commands found instead are handled
    /// and may bring the room back to active.
    fn try_retire(&mut self) -> bool {
        loop {
            let mut rooms = lock_rooms(&self.rooms);
            match self.inbox.try_recv() {
                Ok(cmd) => {
                    drop(rooms);
                    self.handle(cmd);
                    self.reap_dead();
                    if !self.ready_to_retire() {
                        return false;
                    }
                }
                Err(_) => {
                    if rooms.get(&self.id).is_some_and(|h| h.generation == self.generation) {
                        rooms.remove(&self.id);
                    }
                    return true;
                }
            }
        }
    }

    fn set_phase(&self, phase: RoomPhase) {
        self.phase.send_replace(phase);
    }

    // ─── Commands ─────────────────────────────────────────────────────

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { conn, outbox, reply } => {
                if !self.hub.contains(conn) {
                    self.hub.join(conn, outbox, &self.document, &self.presence);
                }
                if self.drain.take().is_some() {
                    log::info!("Room {} reactivated by {conn}", self.id);
                    self.set_phase(RoomPhase::Active);
                }
                let _ = reply.send(Ok(()));
            }
            RoomCommand::Frame { conn, data } => {
                if !self.hub.contains(conn) {
                    log::trace!("Ignoring frame from departed socket {conn}");
                    return;
                }
                let result = self.hub.handle_frame(
                    conn,
                    &data,
                    &mut self.document,
                    &mut self.presence,
                    &mut self.pending,
                );
                if let Err(e) = result {
                    log::warn!("Closing socket {conn} in room {}: {e}", self.id);
                    self.leave(conn);
                }
            }
            RoomCommand::Control { conn, frame } => match frame {
                ControlFrame::Join { client_id, display_name } => {
                    self.hub.identify(conn, client_id, &display_name, &mut self.presence);
                }
                ControlFrame::Save => {
                    log::debug!("Explicit save requested in room {}", self.id);
                    self.flush(false);
                }
                ControlFrame::Snapshot => {
                    self.hub.send_snapshot(conn, &self.document);
                }
            },
            RoomCommand::Leave { conn } => self.leave(conn),
            RoomCommand::Edit { namespace, id, value, reply } => {
                let _ = reply.send(self.edit(&namespace, &id, value));
            }
            RoomCommand::Save => {
                self.flush(false);
            }
            RoomCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn leave(&mut self, conn: ConnId) {
        if let Some(changes) = self.hub.leave(conn, &mut self.presence) {
            log::debug!(
                "Socket {conn} left room {} ({} presence entries removed)",
                self.id,
                changes.removed.len()
            );
        }
    }

    fn reap_dead(&mut self) {
        loop {
            let dead = self.hub.take_dead();
            if dead.is_empty() {
                break;
            }
            for conn in dead {
                self.leave(conn);
            }
        }
    }

    fn edit(&mut self, namespace: &str, id: &str, value: Option<Value>) -> Result<bool, RoomError> {
        let delta = match value {
            Some(value) => Some(self.document.apply_local(namespace, id, &value)?),
            None => self.document.remove_local(namespace, id),
        };
        let Some(delta) = delta else {
            return Ok(false);
        };
        self.pending.mark_dirty();
        self.hub.broadcast_except(None, &Message::Update(delta).encode());
        // A write after the final flush started needs one more flush
        if let Some(drain) = self.drain.as_mut() {
            drain.flushed = false;
            self.advance_drain();
        }
        Ok(true)
    }

    fn status(&self) -> RoomStatus {
        RoomStatus {
            phase: *self.phase.borrow(),
            peers: self.hub.len(),
            presence_entries: self.presence.len(),
            dirty: self.pending.is_dirty(),
            save_in_flight: self.pending.in_flight(),
            hub: self.hub.stats(),
            snapshot: self.document.export_all(),
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn on_tick(&mut self) {
        let expired = self.presence.expire_stale(self.ctx.config.presence_timeout());
        self.hub.broadcast_presence(&expired, &self.presence);

        if self.drain.is_none() {
            self.flush(false);
        }
    }

    /// Ask the bridge for a decision and spawn the save if there is one.
    fn flush(&mut self, force: bool) {
        match self.ctx.bridge.prepare(&mut self.pending, &self.document, force) {
            FlushDecision::Save(payload) => {
                log::debug!("Saving room {} ({} bytes)", self.id, payload.len());
                let save = self.ctx.bridge.save(&self.id, payload);
                let done = self.saves_tx.clone();
                tokio::spawn(async move {
                    let _ = done.send(save.await);
                });
            }
            FlushDecision::InFlight => {
                log::trace!("Save already in flight for room {}", self.id);
            }
            FlushDecision::Clean | FlushDecision::Empty => {}
        }
    }

    fn on_save_completed(&mut self, outcome: SaveOutcome) {
        self.ctx.bridge.complete(&self.id, &mut self.pending, &outcome);
        self.advance_drain();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::registry::RoomRegistry;
    use crate::storage::MemorySnapshotStore;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn registry(store: &MemorySnapshotStore, config: ServerConfig) -> RoomRegistry {
        RoomRegistry::new(config, Arc::new(store.clone()))
    }

    async fn wait_destroyed(registry: &RoomRegistry, room: &str) {
        if let Some(mut phase) = registry.watch_phase(room) {
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                phase.wait_for(|p| *p == RoomPhase::Destroyed),
            )
            .await;
        }
    }

    #[tokio::test]
    async fn test_load_failure_rejects_join() {
        let store = MemorySnapshotStore::new();
        store.set_fail_loads(true);
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, _rx) = mpsc::channel(8);
        let err = registry.join("broken", Uuid::new_v4(), tx).await.unwrap_err();
        assert!(matches!(err, RoomError::LoadFailed(StoreError::Unavailable(_))));
        assert!(registry.phase("broken").is_none());
    }

    #[tokio::test]
    async fn test_load_failure_can_start_empty() {
        let store = MemorySnapshotStore::new();
        store.set_fail_loads(true);
        let config = ServerConfig { start_empty_on_load_failure: true, ..ServerConfig::for_testing() };
        let registry = registry(&store, config);

        let (tx, _rx) = mpsc::channel(8);
        registry.join("broken", Uuid::new_v4(), tx).await.unwrap();
        assert_eq!(registry.phase("broken"), Some(RoomPhase::Active));
    }

    #[tokio::test]
    async fn test_unparsable_snapshot_is_load_failure() {
        let store = MemorySnapshotStore::new().with_snapshot("bad", "not json");
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, _rx) = mpsc::channel(8);
        let err = registry.join("bad", Uuid::new_v4(), tx).await.unwrap_err();
        assert!(matches!(err, RoomError::LoadFailed(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_last_leave_flushes_once_and_destroys() {
        let store = MemorySnapshotStore::new();
        let config = ServerConfig { save_interval_ms: 60_000, ..ServerConfig::for_testing() };
        let registry = registry(&store, config);

        let (tx, _rx) = mpsc::channel(8);
        let link = registry.join("r1", Uuid::new_v4(), tx).await.unwrap();
        assert!(registry.edit("r1", "nodes", "n1", Some(json!({"x": 1}))).await.unwrap());

        link.leave();
        wait_destroyed(&registry, "r1").await;

        assert_eq!(store.save_calls(), 1);
        let saved = SnapshotPayload::from_text(&store.get("r1").unwrap()).unwrap();
        assert_eq!(saved.namespace("nodes").len(), 1);
        assert!(registry.active_rooms().is_empty());
    }

    #[tokio::test]
    async fn test_empty_room_never_saved() {
        let store = MemorySnapshotStore::new();
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, _rx) = mpsc::channel(8);
        let link = registry.join("empty", Uuid::new_v4(), tx).await.unwrap();
        link.leave();
        wait_destroyed(&registry, "empty").await;

        assert_eq!(store.save_calls(), 0);
    }

    #[tokio::test]
    async fn test_periodic_save_only_when_dirty() {
        let store = MemorySnapshotStore::new();
        let config = ServerConfig { save_interval_ms: 50, ..ServerConfig::for_testing() };
        let registry = registry(&store, config);

        let (tx, _rx) = mpsc::channel(64);
        let _link = registry.join("p", Uuid::new_v4(), tx).await.unwrap();
        registry.edit("p", "nodes", "n1", Some(json!({}))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.save_calls(), 1);
        let status = registry.status("p").await.unwrap();
        assert!(!status.dirty);
        assert_eq!(status.phase, RoomPhase::Active);
    }

    #[tokio::test]
    async fn test_failed_save_retried_next_interval() {
        let store = MemorySnapshotStore::new();
        store.set_failing(true);
        let config = ServerConfig { save_interval_ms: 50, ..ServerConfig::for_testing() };
        let registry = registry(&store, config);

        let (tx, _rx) = mpsc::channel(64);
        let _link = registry.join("f", Uuid::new_v4(), tx).await.unwrap();
        registry.edit("f", "nodes", "n1", Some(json!({}))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.save_calls() >= 2);
        let status = registry.status("f").await.unwrap();
        assert!(status.dirty || status.save_in_flight);

        store.set_failing(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.status("f").await.unwrap().dirty);
        assert!(store.get("f").is_some());
    }

    #[tokio::test]
    async fn test_rejoin_after_destroy_reloads_snapshot() {
        let store = MemorySnapshotStore::new();
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, _rx) = mpsc::channel(8);
        let link = registry.join("cycle", Uuid::new_v4(), tx).await.unwrap();
        registry.edit("cycle", "edges", "e1", Some(json!({"source": "a"}))).await.unwrap();
        link.leave();
        wait_destroyed(&registry, "cycle").await;

        let (tx, _rx) = mpsc::channel(8);
        let _link = registry.join("cycle", Uuid::new_v4(), tx).await.unwrap();
        let snapshot = registry.snapshot("cycle").await.unwrap();
        assert_eq!(snapshot.namespace("edges")[0]["id"], json!("e1"));
        assert_eq!(store.load_calls(), 2);
    }

    #[tokio::test]
    async fn test_join_during_drain_reactivates() {
        let store = MemorySnapshotStore::new();
        store.set_delay(Duration::from_millis(300));
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, _rx) = mpsc::channel(8);
        let link = registry.join("d", Uuid::new_v4(), tx).await.unwrap();
        registry.edit("d", "nodes", "n1", Some(json!({}))).await.unwrap();
        link.leave();

        // The slow final save keeps the room draining
        let mut phase = registry.watch_phase("d").unwrap();
        tokio::time::timeout(Duration::from_secs(2), phase.wait_for(|p| *p == RoomPhase::Draining))
            .await
            .unwrap()
            .unwrap();

        let (tx, _rx2) = mpsc::channel(8);
        let _link = registry.join("d", Uuid::new_v4(), tx).await.unwrap();
        assert_eq!(registry.phase("d"), Some(RoomPhase::Active));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.phase("d"), Some(RoomPhase::Active));
        assert_eq!(registry.snapshot("d").await.unwrap().namespace("nodes").len(), 1);
    }

    #[tokio::test]
    async fn test_edit_during_drain_reaches_store() {
        let store = MemorySnapshotStore::new();
        store.set_delay(Duration::from_millis(200));
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, _rx) = mpsc::channel(8);
        let link = registry.join("late", Uuid::new_v4(), tx).await.unwrap();
        registry.edit("late", "nodes", "n1", Some(json!({"label": "first"}))).await.unwrap();
        let mut phase = registry.watch_phase("late").unwrap();
        link.leave();

        tokio::time::timeout(Duration::from_secs(2), phase.wait_for(|p| *p == RoomPhase::Draining))
            .await
            .unwrap()
            .unwrap();
        // Lands while the final save of n1 is still running
        assert!(registry
            .edit("late", "nodes", "n2", Some(json!({"label": "second"})))
            .await
            .unwrap());

        wait_destroyed(&registry, "late").await;
        let saved = SnapshotPayload::from_text(&store.get("late").unwrap()).unwrap();
        let ids: Vec<_> = saved.namespace("nodes").iter().map(|e| e["id"].clone()).collect();
        assert_eq!(ids, vec![json!("n1"), json!("n2")]);
        assert_eq!(store.save_calls(), 2);
        assert!(registry.phase("late").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_control_frame_answers_sender() {
        let store = MemorySnapshotStore::new();
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, mut rx) = mpsc::channel(8);
        let link = registry.join("s", Uuid::new_v4(), tx).await.unwrap();
        let _step1 = rx.recv().await.unwrap();
        registry.edit("s", "nodes", "n1", Some(json!({"label": "A"}))).await.unwrap();
        let _update = rx.recv().await.unwrap();

        link.control(ControlFrame::Snapshot).unwrap();
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let reply: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reply["type"], json!("snapshot"));
        assert_eq!(reply["diagram"]["nodes"][0], json!({"id": "n1", "label": "A"}));
        assert_eq!(reply["diagram"]["edges"], json!([]));
    }

    #[tokio::test]
    async fn test_edit_broadcasts_to_sockets() {
        let store = MemorySnapshotStore::new();
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx, mut rx) = mpsc::channel(8);
        let _link = registry.join("e", Uuid::new_v4(), tx).await.unwrap();
        let _step1 = rx.recv().await.unwrap();

        registry.edit("e", "nodes", "n1", Some(json!({"x": 1}))).await.unwrap();
        let Some(Outbound::Binary(frame)) = rx.recv().await else {
            panic!("expected a binary frame");
        };
        let (msg, _) = Message::decode(&frame).unwrap();
        assert!(matches!(msg, Message::Update(_)));

        assert!(!registry.edit("e", "nodes", "missing", None).await.unwrap());
        assert!(registry.edit("e", "nodes", "n1", None).await.unwrap());
        assert!(matches!(
            registry.edit("nowhere", "nodes", "n1", None).await,
            Err(RoomError::UnknownRoom(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_socket() {
        let store = MemorySnapshotStore::new();
        let registry = registry(&store, ServerConfig::for_testing());

        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let link_a = registry.join("m", Uuid::new_v4(), tx_a).await.unwrap();
        let _link_b = registry.join("m", Uuid::new_v4(), tx_b).await.unwrap();

        link_a.frame(vec![9, 9, 9]).unwrap();
        let status = registry.status("m").await.unwrap();
        assert_eq!(status.peers, 1);
        assert_eq!(status.phase, RoomPhase::Active);
    }
}

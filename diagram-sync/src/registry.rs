//! Process-wide map of live rooms.
//!
//! The map is the only shared mutable structure in the server. Room
//! creation and every command send happen under its lock; a room actor
//! removes itself under the same lock, which is what makes
//! join-versus-teardown race free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ServerConfig;
use crate::document::SnapshotPayload;
use crate::hub::{ConnId, ControlFrame, Outbox};
use crate::persistence::{PersistenceBridge, SnapshotStore};
use crate::room::{RoomActor, RoomCommand, RoomContext, RoomError, RoomId, RoomPhase, RoomStatus};

/// Registry entry for one room incarnation.
pub(crate) struct RoomHandle {
    pub inbox: mpsc::UnboundedSender<RoomCommand>,
    pub phase: watch::Receiver<RoomPhase>,
    /// Distinguishes incarnations of the same room id.
    pub generation: u64,
}

pub(crate) type RoomMap = Arc<Mutex<HashMap<RoomId, RoomHandle>>>;

pub(crate) fn lock_rooms(rooms: &Mutex<HashMap<RoomId, RoomHandle>>) -> MutexGuard<'_, HashMap<RoomId, RoomHandle>> {
    rooms.lock().unwrap_or_else(|e| e.into_inner())
}

/// Creates rooms on first join and routes commands to them.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: RoomMap,
    ctx: Arc<RoomContext>,
    next_generation: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let bridge = PersistenceBridge::new(store, config.save_timeout());
        let namespaces = config.namespace_list();
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            ctx: Arc::new(RoomContext { config, bridge, namespaces }),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Attach a socket to `room_id`, creating and loading the room if needed.
    ///
    /// Resolves once the room has registered the socket, i.e. after the
    /// snapshot load for a fresh room.
    pub async fn join(&self, room_id: &str, conn: ConnId, outbox: Outbox) -> Result<RoomLink, RoomError> {
        let (reply, done) = oneshot::channel();
        let inbox = {
            let mut rooms = lock_rooms(&self.rooms);
            let stale = rooms.get(room_id).map_or(true, |h| h.inbox.is_closed());
            if stale {
                let handle = self.spawn_room(room_id);
                rooms.insert(room_id.to_string(), handle);
            }
            let handle = rooms.get(room_id).ok_or(RoomError::Closed)?;
            handle
                .inbox
                .send(RoomCommand::Join { conn, outbox, reply })
                .map_err(|_| RoomError::Closed)?;
            handle.inbox.clone()
        };

        done.await.map_err(|_| RoomError::Closed)??;
        log::debug!("Socket {conn} joined room {room_id}");
        Ok(RoomLink { room_id: room_id.to_string(), conn, inbox })
    }

    /// Apply a server-side write (`Some`) or delete (`None`) to a live room
    /// and relay it to every socket. Returns whether anything changed.
    pub async fn edit(
        &self,
        room_id: &str,
        namespace: &str,
        id: &str,
        value: Option<Value>,
    ) -> Result<bool, RoomError> {
        let (reply, done) = oneshot::channel();
        self.send(
            room_id,
            RoomCommand::Edit {
                namespace: namespace.to_string(),
                id: id.to_string(),
                value,
                reply,
            },
        )?;
        done.await.map_err(|_| RoomError::Closed)?
    }

    /// Request an immediate flush of a live room.
    pub fn save(&self, room_id: &str) -> Result<(), RoomError> {
        self.send(room_id, RoomCommand::Save)
    }

    pub async fn status(&self, room_id: &str) -> Result<RoomStatus, RoomError> {
        let (reply, done) = oneshot::channel();
        self.send(room_id, RoomCommand::Status { reply })?;
        done.await.map_err(|_| RoomError::Closed)
    }

    /// Current materialized document of a live room.
    pub async fn snapshot(&self, room_id: &str) -> Result<SnapshotPayload, RoomError> {
        Ok(self.status(room_id).await?.snapshot)
    }

    /// Lifecycle phase, `None` when no room is registered under `room_id`.
    pub fn phase(&self, room_id: &str) -> Option<RoomPhase> {
        let rooms = lock_rooms(&self.rooms);
        rooms.get(room_id).map(|h| *h.phase.borrow())
    }

    /// Subscribe to phase changes of a registered room.
    pub fn watch_phase(&self, room_id: &str) -> Option<watch::Receiver<RoomPhase>> {
        let rooms = lock_rooms(&self.rooms);
        rooms.get(room_id).map(|h| h.phase.clone())
    }

    /// Ids of every registered room, sorted.
    pub fn active_rooms(&self) -> Vec<RoomId> {
        let rooms = lock_rooms(&self.rooms);
        let mut ids: Vec<RoomId> = rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn send(&self, room_id: &str, cmd: RoomCommand) -> Result<(), RoomError> {
        let rooms = lock_rooms(&self.rooms);
        let handle = rooms
            .get(room_id)
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        handle.inbox.send(cmd).map_err(|_| RoomError::Closed)
    }

    /// Must be called with the registry lock held.
    fn spawn_room(&self, room_id: &str) -> RoomHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(RoomPhase::Uninitialized);

        let actor = RoomActor::new(
            room_id.to_string(),
            generation,
            self.ctx.clone(),
            self.rooms.clone(),
            inbox_rx,
            phase_tx,
        );
        tokio::spawn(actor.run());
        log::info!("Room {room_id} created (generation {generation})");

        RoomHandle { inbox: inbox_tx, phase: phase_rx, generation }
    }
}

/// A socket's attachment to its room.
///
/// Sends fail with [`RoomError::Closed`] once the room has retired.
#[derive(Debug)]
pub struct RoomLink {
    room_id: RoomId,
    conn: ConnId,
    inbox: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomLink {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Forward a binary protocol frame.
    pub fn frame(&self, data: Vec<u8>) -> Result<(), RoomError> {
        self.inbox
            .send(RoomCommand::Frame { conn: self.conn, data })
            .map_err(|_| RoomError::Closed)
    }

    /// Forward a parsed control frame.
    pub fn control(&self, frame: ControlFrame) -> Result<(), RoomError> {
        self.inbox
            .send(RoomCommand::Control { conn: self.conn, frame })
            .map_err(|_| RoomError::Closed)
    }

    /// Detach the socket. Dropping a link without calling this leaves the
    /// socket registered until its outbound queue is found closed.
    pub fn leave(self) {
        let _ = self.inbox.send(RoomCommand::Leave { conn: self.conn });
    }
}

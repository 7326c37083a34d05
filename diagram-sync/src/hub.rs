//! Per-room socket set and message relay.
//!
//! The hub is owned by the room actor, so it needs no locks. Each socket is
//! represented by a bounded outbound queue drained by the connection's
//! writer task. Fan-out never blocks the room: a socket whose queue is full
//! or closed is marked dead and reaped by the room on the next turn.
//!
//! ```text
//! frame from A ──► MessageReader ──┬─ SyncStep1 ──► SyncStep2 to A only
//!                                  ├─ Step2/Update ──► document ──► UPDATE to B, C
//!                                  ├─ Awareness ──► presence ──► changed subset to B, C
//!                                  └─ Query ──► full presence to A only
//! ```
//!
//! Control frames travel as JSON text; `{"type":"snapshot"}` is answered
//! to the sender with the materialized diagram.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{CodecError, Message, MessageReader};
use crate::document::{DocumentError, ReplicatedDocument, SnapshotPayload};
use crate::persistence::PendingSave;
use crate::presence::{color_for, ClientId, PresenceChanges, PresenceTracker};

/// Identifies one live socket.
pub type ConnId = Uuid;

/// One queued frame for a socket's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// y-protocols frame.
    Binary(Vec<u8>),
    /// JSON reply to a control frame.
    Text(String),
}

impl Outbound {
    pub fn len(&self) -> usize {
        match self {
            Outbound::Binary(bytes) => bytes.len(),
            Outbound::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sending half of a socket's outbound queue.
pub type Outbox = mpsc::Sender<Outbound>;

/// JSON text frames sent alongside the binary protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlFrame {
    /// Identify the connection's presence client.
    #[serde(rename_all = "camelCase")]
    Join { client_id: ClientId, display_name: String },
    /// Request an immediate save.
    Save,
    /// Request the current diagram as JSON.
    Snapshot,
}

/// JSON text frames the server sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplyFrame {
    /// Answer to [`ControlFrame::Snapshot`].
    Snapshot { diagram: SnapshotPayload },
}

/// Relay counters for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub sockets_dropped: u64,
    pub active_peers: usize,
}

struct Peer {
    outbox: Outbox,
    /// Presence clients this socket answers for.
    controlled: HashSet<ClientId>,
    dead: bool,
}

/// Live sockets of a room.
#[derive(Default)]
pub struct ConnectionHub {
    peers: HashMap<ConnId, Peer>,
    /// Sockets that failed a send, waiting for the room to run `leave`.
    dead: Vec<ConnId>,
    /// Identified clients so far; drives color assignment.
    identified: usize,
    stats: HubStats,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.peers.contains_key(&conn)
    }

    /// Presence client ids owned by `conn`.
    pub fn controlled(&self, conn: ConnId) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .peers
            .get(&conn)
            .map(|p| p.controlled.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> HubStats {
        HubStats { active_peers: self.peers.len(), ..self.stats.clone() }
    }

    /// Register a socket and start the handshake: our state vector first,
    /// then the current presence snapshot if anyone is present.
    pub fn join(
        &mut self,
        conn: ConnId,
        outbox: Outbox,
        document: &ReplicatedDocument,
        presence: &PresenceTracker,
    ) {
        self.peers.insert(conn, Peer { outbox, controlled: HashSet::new(), dead: false });
        log::debug!("Socket {conn} joined hub ({} peers)", self.peers.len());

        self.send_to(conn, Message::SyncStep1(document.state_vector()).encode());
        if !presence.is_empty() {
            self.send_to(conn, Message::Awareness(presence.encode_full()).encode());
        }
    }

    /// Process one binary frame from `from`.
    ///
    /// Any decode failure is returned; the room treats it as fatal for the
    /// socket. Messages decoded before the failure have already been applied.
    pub fn handle_frame(
        &mut self,
        from: ConnId,
        frame: &[u8],
        document: &mut ReplicatedDocument,
        presence: &mut PresenceTracker,
        pending: &mut PendingSave,
    ) -> Result<(), CodecError> {
        for message in MessageReader::new(frame) {
            match message? {
                Message::SyncStep1(state_vector) => {
                    let diff = document.diff_since(&state_vector).map_err(into_codec)?;
                    self.send_to(from, Message::SyncStep2(diff).encode());
                }
                Message::SyncStep2(delta) | Message::Update(delta) => {
                    self.relay_document_update(from, &delta, document, pending)
                        .map_err(into_codec)?;
                }
                Message::Awareness(update) => {
                    self.relay_presence_update(from, &update, presence)?;
                }
                Message::QueryAwareness => {
                    self.send_to(from, Message::Awareness(presence.encode_full()).encode());
                }
            }
        }
        Ok(())
    }

    /// Merge a peer's delta and fan it out to everyone else. The room is
    /// marked dirty only when the delta changed the document.
    pub fn relay_document_update(
        &mut self,
        from: ConnId,
        delta: &[u8],
        document: &mut ReplicatedDocument,
        pending: &mut PendingSave,
    ) -> Result<(), DocumentError> {
        if document.apply_remote_delta(delta)? {
            pending.mark_dirty();
        }
        log::trace!("Relaying {} byte update from {from}", delta.len());
        self.broadcast_except(Some(from), &Message::Update(delta.to_vec()).encode());
        Ok(())
    }

    /// Merge a peer's presence update and fan out the changed subset.
    ///
    /// Clients the update adds become owned by `from`; removed ones are
    /// released.
    pub fn relay_presence_update(
        &mut self,
        from: ConnId,
        update: &[u8],
        presence: &mut PresenceTracker,
    ) -> Result<PresenceChanges, CodecError> {
        let changes = presence.apply_update(update)?;
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.controlled.extend(changes.added.iter().copied());
            for id in &changes.removed {
                peer.controlled.remove(id);
            }
        }
        if !changes.is_empty() {
            let encoded = presence.encode_update(&changes.changed());
            self.broadcast_except(Some(from), &Message::Awareness(encoded).encode());
        }
        Ok(changes)
    }

    /// Handle a `join` control frame: assign a color and publish the
    /// client's presence to every socket, the sender included.
    pub fn identify(
        &mut self,
        conn: ConnId,
        client_id: ClientId,
        display_name: &str,
        presence: &mut PresenceTracker,
    ) -> Option<PresenceChanges> {
        let peer = self.peers.get_mut(&conn)?;
        peer.controlled.insert(client_id);

        let color = color_for(self.identified);
        self.identified += 1;

        let mut state = Map::new();
        state.insert("displayName".to_string(), Value::String(display_name.to_string()));
        state.insert("color".to_string(), Value::String(color.to_string()));
        let changes = presence.set_local_state(client_id, state);

        log::info!("Client {client_id} ({display_name}) identified on {conn} with color {color}");
        let encoded = presence.encode_update(&changes.changed());
        self.broadcast_except(None, &Message::Awareness(encoded).encode());
        Some(changes)
    }

    /// Remove a socket and every presence entry it owned, telling the rest.
    ///
    /// Returns `None` if the socket was not registered.
    pub fn leave(&mut self, conn: ConnId, presence: &mut PresenceTracker) -> Option<PresenceChanges> {
        let peer = self.peers.remove(&conn)?;
        self.dead.retain(|id| *id != conn);

        let changes = presence.remove_clients(peer.controlled);
        if !changes.removed.is_empty() {
            let encoded = presence.encode_update(&changes.removed);
            self.broadcast_except(None, &Message::Awareness(encoded).encode());
        }
        log::debug!("Socket {conn} left hub ({} peers remain)", self.peers.len());
        Some(changes)
    }

    /// Answer a `snapshot` control frame with the diagram as JSON text.
    pub fn send_snapshot(&mut self, conn: ConnId, document: &ReplicatedDocument) -> bool {
        let reply = ReplyFrame::Snapshot { diagram: document.export_all() };
        match serde_json::to_string(&reply) {
            Ok(text) => self.push(conn, Outbound::Text(text)),
            Err(e) => {
                log::error!("Failed to encode snapshot for {conn}: {e}");
                false
            }
        }
    }

    /// Send presence changes produced outside a relay (expiry).
    pub fn broadcast_presence(&mut self, changes: &PresenceChanges, presence: &PresenceTracker) {
        if changes.is_empty() {
            return;
        }
        for peer in self.peers.values_mut() {
            for id in &changes.removed {
                peer.controlled.remove(id);
            }
        }
        let encoded = presence.encode_update(&changes.changed());
        self.broadcast_except(None, &Message::Awareness(encoded).encode());
    }

    /// Queue a binary frame for one socket. Returns `false` if the socket
    /// is gone or was just marked dead.
    pub fn send_to(&mut self, conn: ConnId, frame: Vec<u8>) -> bool {
        self.push(conn, Outbound::Binary(frame))
    }

    fn push(&mut self, conn: ConnId, frame: Outbound) -> bool {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return false;
        };
        if peer.dead {
            return false;
        }
        let len = frame.len() as u64;
        match peer.outbox.try_send(frame) {
            Ok(()) => {
                self.stats.messages_relayed += 1;
                self.stats.bytes_relayed += len;
                true
            }
            Err(e) => {
                log::warn!("Dropping socket {conn}: outbound queue {}", send_failure(&e));
                peer.dead = true;
                self.dead.push(conn);
                self.stats.sockets_dropped += 1;
                false
            }
        }
    }

    /// Queue a frame for every live socket except `except`.
    pub fn broadcast_except(&mut self, except: Option<ConnId>, frame: &[u8]) -> usize {
        let targets: Vec<ConnId> = self
            .peers
            .iter()
            .filter(|(id, peer)| Some(**id) != except && !peer.dead)
            .map(|(id, _)| *id)
            .collect();

        targets
            .into_iter()
            .filter(|id| self.send_to(*id, frame.to_vec()))
            .count()
    }

    /// Sockets that failed a send since the last call.
    pub fn take_dead(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.dead)
    }
}

fn send_failure<T>(e: &mpsc::error::TrySendError<T>) -> &'static str {
    match e {
        mpsc::error::TrySendError::Full(_) => "full",
        mpsc::error::TrySendError::Closed(_) => "closed",
    }
}

fn into_codec(e: DocumentError) -> CodecError {
    match e {
        DocumentError::Malformed(inner) => inner,
        other => CodecError::Malformed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageKind;
    use serde_json::json;

    struct Harness {
        hub: ConnectionHub,
        document: ReplicatedDocument,
        presence: PresenceTracker,
        pending: PendingSave,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                hub: ConnectionHub::new(),
                document: ReplicatedDocument::new(),
                presence: PresenceTracker::new(),
                pending: PendingSave::new(),
            }
        }

        fn connect(&mut self, capacity: usize) -> (ConnId, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel(capacity);
            let conn = Uuid::new_v4();
            self.hub.join(conn, tx, &self.document, &self.presence);
            (conn, rx)
        }

        fn frame(&mut self, from: ConnId, frame: &[u8]) -> Result<(), CodecError> {
            self.hub.handle_frame(from, frame, &mut self.document, &mut self.presence, &mut self.pending)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let Outbound::Binary(frame) = frame else {
                panic!("unexpected text frame: {frame:?}");
            };
            for msg in MessageReader::new(&frame) {
                out.push(msg.unwrap());
            }
        }
        out
    }

    fn client_delta(client_id: u64, id: &str) -> Vec<u8> {
        let mut replica = ReplicatedDocument::with_client_id(client_id);
        replica.apply_local("nodes", id, &json!({"x": 1})).unwrap()
    }

    #[test]
    fn test_join_sends_sync_step1() {
        let mut h = Harness::new();
        let (_, mut rx) = h.connect(8);
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), MessageKind::SyncStep1);
        assert_eq!(msgs[0].payload(), h.document.state_vector().as_slice());
    }

    #[test]
    fn test_join_sends_presence_snapshot_when_present() {
        let mut h = Harness::new();
        let (a, _rx_a) = h.connect(8);
        h.hub.identify(a, 11, "Ada", &mut h.presence).unwrap();

        let (_, mut rx_b) = h.connect(8);
        let kinds: Vec<_> = drain(&mut rx_b).iter().map(Message::kind).collect();
        assert_eq!(kinds, vec![MessageKind::SyncStep1, MessageKind::Awareness]);
    }

    #[test]
    fn test_update_relayed_without_self_echo() {
        let mut h = Harness::new();
        let (a, mut rx_a) = h.connect(8);
        let (_, mut rx_b) = h.connect(8);
        let (_, mut rx_c) = h.connect(8);
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        let delta = client_delta(100, "n1");
        h.frame(a, &Message::Update(delta.clone()).encode()).unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![Message::Update(delta.clone())]);
        assert_eq!(drain(&mut rx_c), vec![Message::Update(delta)]);
        assert!(h.pending.is_dirty());
        assert!(h.document.get("nodes", "n1").is_some());
    }

    #[test]
    fn test_duplicate_update_does_not_mark_dirty() {
        let mut h = Harness::new();
        let (a, _rx_a) = h.connect(8);
        let delta = client_delta(100, "n1");
        h.frame(a, &Message::Update(delta.clone()).encode()).unwrap();
        assert!(h.pending.is_dirty());

        // Replayed after the room saved: nothing new to persist
        h.pending = PendingSave::new();
        h.frame(a, &Message::Update(delta).encode()).unwrap();
        assert!(!h.pending.is_dirty());

        // An empty step2 from a client that is already in sync
        let replica = ReplicatedDocument::with_client_id(100);
        let nothing = replica.diff_since(&replica.state_vector()).unwrap();
        h.frame(a, &Message::SyncStep2(nothing).encode()).unwrap();
        assert!(!h.pending.is_dirty());
    }

    #[test]
    fn test_snapshot_reply_to_sender_only() {
        let mut h = Harness::new();
        h.document.apply_local("nodes", "n1", &json!({"label": "A"})).unwrap();
        let (a, mut rx_a) = h.connect(8);
        let (_, mut rx_b) = h.connect(8);
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert!(h.hub.send_snapshot(a, &h.document));
        let Ok(Outbound::Text(text)) = rx_a.try_recv() else {
            panic!("expected a text frame");
        };
        let reply: ReplyFrame = serde_json::from_str(&text).unwrap();
        let ReplyFrame::Snapshot { diagram } = reply;
        assert_eq!(diagram, h.document.export_all());
        assert!(text.starts_with(r#"{"type":"snapshot","diagram":"#));
        assert!(rx_b.try_recv().is_err());
        assert!(!h.hub.send_snapshot(Uuid::new_v4(), &h.document));
    }

    #[test]
    fn test_sync_step1_answered_to_sender_only() {
        let mut h = Harness::new();
        h.document.apply_local("nodes", "n1", &json!({"x": 1})).unwrap();
        let (a, mut rx_a) = h.connect(8);
        let (_, mut rx_b) = h.connect(8);
        drain(&mut rx_a);
        drain(&mut rx_b);

        let empty = ReplicatedDocument::with_client_id(5);
        h.frame(a, &Message::SyncStep1(empty.state_vector()).encode()).unwrap();

        let msgs = drain(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        let mut replica = ReplicatedDocument::with_client_id(5);
        replica.apply_remote_delta(msgs[0].payload()).unwrap();
        assert!(replica.get("nodes", "n1").is_some());
        assert!(drain(&mut rx_b).is_empty());
        assert!(!h.pending.is_dirty());
    }

    #[test]
    fn test_sync_step2_treated_as_update() {
        let mut h = Harness::new();
        let (a, _rx_a) = h.connect(8);
        let (_, mut rx_b) = h.connect(8);
        drain(&mut rx_b);

        let delta = client_delta(100, "n9");
        h.frame(a, &Message::SyncStep2(delta.clone()).encode()).unwrap();
        assert_eq!(drain(&mut rx_b), vec![Message::Update(delta)]);
    }

    #[test]
    fn test_presence_relay_and_ownership() {
        let mut h = Harness::new();
        let (a, mut rx_a) = h.connect(8);
        let (_, mut rx_b) = h.connect(8);
        drain(&mut rx_a);
        drain(&mut rx_b);

        let mut remote = PresenceTracker::new();
        let changes = remote.set_local_state(42, Map::new());
        let update = remote.encode_update(&changes.changed());
        h.frame(a, &Message::Awareness(update).encode()).unwrap();

        assert_eq!(h.hub.controlled(a), vec![42]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);

        // Leaving removes the owned entry and tells the others
        h.hub.leave(a, &mut h.presence).unwrap();
        assert!(h.presence.is_empty());
        let msgs = drain(&mut rx_b);
        assert_eq!(msgs.len(), 1);
        let mut mirror = PresenceTracker::new();
        mirror.set_local_state(42, Map::new());
        let c = mirror.apply_update(msgs[0].payload()).unwrap();
        assert_eq!(c.removed, vec![42]);
    }

    #[test]
    fn test_leave_after_max_clock_presence() {
        use yrs::encoding::write::Write;

        let mut h = Harness::new();
        let (a, _rx_a) = h.connect(8);
        let (_, mut rx_b) = h.connect(8);
        drain(&mut rx_b);

        let mut update = Vec::new();
        update.write_var(1u64);
        update.write_var(42u64);
        update.write_var(u64::MAX);
        update.write_string(r#"{"displayName":"Ada"}"#);
        h.frame(a, &Message::Awareness(update).encode()).unwrap();
        assert_eq!(drain(&mut rx_b).len(), 1);

        h.hub.leave(a, &mut h.presence).unwrap();
        assert!(h.presence.is_empty());
        let msgs = drain(&mut rx_b);
        assert_eq!(msgs.len(), 1);

        let mut mirror = PresenceTracker::new();
        let mut seed = Vec::new();
        seed.write_var(1u64);
        seed.write_var(42u64);
        seed.write_var(u64::MAX);
        seed.write_string(r#"{"displayName":"Ada"}"#);
        mirror.apply_update(&seed).unwrap();
        let c = mirror.apply_update(msgs[0].payload()).unwrap();
        assert_eq!(c.removed, vec![42]);
    }

    #[test]
    fn test_query_awareness_returns_full_snapshot() {
        let mut h = Harness::new();
        let (a, mut rx_a) = h.connect(8);
        h.hub.identify(a, 1, "Ada", &mut h.presence).unwrap();
        drain(&mut rx_a);

        h.frame(a, &Message::QueryAwareness.encode()).unwrap();
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        let mut mirror = PresenceTracker::new();
        mirror.apply_update(msgs[0].payload()).unwrap();
        assert_eq!(mirror.state(1).unwrap()["displayName"], json!("Ada"));
    }

    #[test]
    fn test_identify_assigns_colors_in_join_order() {
        let mut h = Harness::new();
        let (a, _ra) = h.connect(8);
        let (b, _rb) = h.connect(8);
        h.hub.identify(a, 1, "Ada", &mut h.presence).unwrap();
        h.hub.identify(b, 2, "Bo", &mut h.presence).unwrap();

        assert_eq!(h.presence.state(1).unwrap()["color"], json!(color_for(0)));
        assert_eq!(h.presence.state(2).unwrap()["color"], json!(color_for(1)));
        assert!(h.hub.identify(Uuid::new_v4(), 3, "Ghost", &mut h.presence).is_none());
    }

    #[test]
    fn test_malformed_frame_is_error() {
        let mut h = Harness::new();
        let (a, _rx) = h.connect(8);
        assert!(h.frame(a, &[0, 2, 50, 1]).is_err());
        assert!(h.frame(a, &Message::Update(vec![0xFF, 0xFF]).encode()).is_err());
        assert!(h.frame(a, &Message::SyncStep1(vec![0xFF]).encode()).is_err());
    }

    #[test]
    fn test_full_queue_marks_socket_dead() {
        let mut h = Harness::new();
        let (a, _rx_a) = h.connect(8);
        // Capacity 1 is consumed by the join handshake
        let (slow, _rx_slow) = h.connect(1);

        h.frame(a, &Message::Update(client_delta(1, "n1")).encode()).unwrap();
        assert_eq!(h.hub.take_dead(), vec![slow]);
        assert_eq!(h.hub.stats().sockets_dropped, 1);
        assert!(h.hub.take_dead().is_empty());

        // Further sends skip it until the room runs leave
        assert!(!h.hub.send_to(slow, vec![1]));
        h.hub.leave(slow, &mut h.presence).unwrap();
        assert_eq!(h.hub.len(), 1);
    }

    #[test]
    fn test_closed_receiver_marks_socket_dead() {
        let mut h = Harness::new();
        let (a, rx_a) = h.connect(8);
        drop(rx_a);
        assert!(!h.hub.send_to(a, vec![1]));
        assert_eq!(h.hub.take_dead(), vec![a]);
    }

    #[test]
    fn test_stats_count_relayed_bytes() {
        let mut h = Harness::new();
        let (_, _rx) = h.connect(8);
        let stats = h.hub.stats();
        assert_eq!(stats.active_peers, 1);
        assert_eq!(stats.messages_relayed, 1);
        assert!(stats.bytes_relayed > 0);
    }

    #[test]
    fn test_control_frame_json() {
        let join: ControlFrame =
            serde_json::from_str(r#"{"type":"join","clientId":7,"displayName":"Ada"}"#).unwrap();
        assert_eq!(join, ControlFrame::Join { client_id: 7, display_name: "Ada".into() });

        let save: ControlFrame = serde_json::from_str(r#"{"type":"save"}"#).unwrap();
        assert_eq!(save, ControlFrame::Save);
        let snapshot: ControlFrame = serde_json::from_str(r#"{"type":"snapshot"}"#).unwrap();
        assert_eq!(snapshot, ControlFrame::Snapshot);
        assert!(serde_json::from_str::<ControlFrame>(r#"{"type":"auth"}"#).is_err());
    }
}

//! # diagram-sync: Real-time sync engine for collaborative diagrams
//!
//! Browser clients edit the same diagram over WebSockets. Edits converge
//! through a CRDT document per room; cursors and "who is online" travel as
//! ephemeral presence; the document is flushed lazily to a snapshot store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   y-protocols frames   ┌──────────────────────────────┐
//! │ Browser     │ ◄────────────────────► │ SyncServer (socket tasks)    │
//! │ (Yjs doc)   │   JSON control frames  └──────────────┬───────────────┘
//! └─────────────┘                                       │ RoomLink
//!                                                       ▼
//!                              ┌─────────────────────────────────────────┐
//!                              │ Room actor (one per diagram)            │
//!                              │  ReplicatedDocument  PresenceTracker    │
//!                              │  ConnectionHub       PendingSave        │
//!                              └──────────────┬──────────────────────────┘
//!                                             │ PersistenceBridge
//!                                             ▼
//!                              ┌─────────────────────────────────────────┐
//!                              │ SnapshotStore (RocksDB + LZ4 / memory)  │
//!                              └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: y-protocols sync/awareness framing
//! - [`document`]: CRDT document with JSON snapshot import/export
//! - [`presence`]: awareness states with per-client logical clocks
//! - [`hub`]: per-room socket set and relay rules
//! - [`persistence`]: lazy, single-flight snapshot saving
//! - [`room`]: room actor and lifecycle state machine
//! - [`registry`]: process-wide room map
//! - [`server`]: WebSocket front door
//! - [`storage`]: snapshot store backends

pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use codec::{CodecError, Message, MessageKind, MessageReader};
pub use config::ServerConfig;
pub use document::{DocumentError, ReplicatedDocument, SnapshotPayload, DEFAULT_NAMESPACES};
pub use error::SyncError;
pub use hub::{ConnId, ConnectionHub, ControlFrame, HubStats, Outbound, Outbox, ReplyFrame};
pub use persistence::{FlushDecision, PendingSave, PersistenceBridge, SaveOutcome, SnapshotStore, StoreError};
pub use presence::{ClientId, PresenceChanges, PresenceTracker, COLORS};
pub use registry::{RoomLink, RoomRegistry};
pub use room::{RoomError, RoomId, RoomPhase, RoomStatus};
pub use server::{ServerStats, SyncServer};
pub use storage::{MemorySnapshotStore, RocksSnapshotStore, RoomMetadata, StoreConfig};

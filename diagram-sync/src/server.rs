//! WebSocket front door: one task per socket, one actor per room.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/<room_id>
//!             ├── socket task ──► RoomLink ──► Room actor (room_id)
//! Client B ──┘        ▲                          │  ReplicatedDocument
//!                     │                          │  PresenceTracker
//!                     └──── outbound queue ◄─────┤  ConnectionHub
//!                                                │
//!                                                └── PersistenceBridge
//!                                                        │
//!                                                  SnapshotStore (RocksDB / memory)
//! ```
//!
//! A socket task forwards binary frames and JSON control frames to its
//! room, drains its bounded outbound queue to the wire, and keeps the
//! connection alive with pings. A missed pong, a closed queue or a socket
//! error ends the task, and the room is told the socket left.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::SyncError;
use crate::hub::{ControlFrame, Outbound};
use crate::persistence::SnapshotStore;
use crate::registry::RoomRegistry;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Handshakes refused or joins that failed (e.g. snapshot load error)
    pub rejected_connections: u64,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    registry: RoomRegistry,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let registry = RoomRegistry::new(config.clone(), store);
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn bind(&self) -> Result<TcpListener, SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let mut room_id = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match room_from_path(req.uri().path()) {
                Some(id) => {
                    room_id = Some(id);
                    Ok(resp)
                }
                None => Err(bad_request("missing room id in path")),
            }
        })
        .await;
        let ws_stream = match ws_stream {
            Ok(ws) => ws,
            Err(e) => {
                self.stats.write().await.rejected_connections += 1;
                return Err(e.into());
            }
        };
        let Some(room_id) = room_id else {
            return Ok(());
        };

        let conn = Uuid::new_v4();
        let (outbox, mut outbound) = mpsc::channel(self.config.outbound_capacity);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let link = match self.registry.join(&room_id, conn, outbox).await {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Refusing {addr} for room {room_id}: {e}");
                self.stats.write().await.rejected_connections += 1;
                let _ = ws_sender.close().await;
                return Err(e.into());
            }
        };

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Socket {conn} from {addr} joined room {room_id}");

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        let result: Result<(), SyncError> = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        log::trace!("Socket {conn} sent {} bytes", data.len());
                        if link.frame(data.into()).is_err() {
                            break Ok(());
                        }
                    }
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ControlFrame>(&text) {
                        Ok(frame) => {
                            if link.control(frame).is_err() {
                                break Ok(());
                            }
                        }
                        Err(e) => log::debug!("Ignoring control frame from {conn}: {e}"),
                    },
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },

                // Outgoing frames queued by the room
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        let message = match frame {
                            Outbound::Binary(bytes) => Message::Binary(bytes.into()),
                            Outbound::Text(text) => Message::Text(text.into()),
                        };
                        if let Err(e) = ws_sender.send(message).await {
                            break Err(e.into());
                        }
                    }
                    None => {
                        log::debug!("Room {room_id} dropped socket {conn}");
                        break Ok(());
                    }
                },

                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        log::info!("Socket {conn} missed heartbeat; closing");
                        break Ok(());
                    }
                    awaiting_pong = true;
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        link.leave();
        let _ = ws_sender.close().await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Socket {conn} left room {room_id}");
        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// `/<room_id>` → `room_id`. Trailing slashes are ignored; an empty id is
/// refused.
fn room_from_path(path: &str) -> Option<String> {
    let id = path.trim_matches('/');
    (!id.is_empty()).then(|| id.to_string())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

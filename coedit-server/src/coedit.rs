//! Session hub and message routing around the single shared document.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::document::{DocumentStore, PatchOutcome};
use crate::image::{self, ImageLimits};

/// Liveness ping cadence for connected sockets.
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Grace period beyond the ping cadence before a silent socket is dropped.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// The main object coordinating editor sessions around the shared document.
pub struct Coedit {
    doc: DocumentStore,
    sessions: Sessions,
    image_limits: ImageLimits,
    /// Incremented to obtain unique connection IDs.
    count: AtomicU64,
}

/// A live logical user bound to exactly one connection.
#[derive(Clone)]
struct Session {
    conn: u64,
    name: String,
    color: String,
    last_seen: Instant,
}

/// Events queued for delivery on a single connection.
enum Outbound {
    Deliver(ServerMsg),
    Kick,
}

type Outbox = UnboundedSender<Outbound>;

/// Connection and identity bookkeeping.
#[derive(Default)]
struct Sessions {
    /// Outboxes for every open connection, identified or not.
    conns: DashMap<u64, Outbox>,
    /// Identity bindings, guarded together so takeover stays atomic.
    bindings: Mutex<Bindings>,
}

#[derive(Default)]
struct Bindings {
    users: HashMap<String, Session>,
    by_conn: HashMap<u64, String>,
}

impl Sessions {
    fn send_to(&self, conn: u64, msg: ServerMsg) {
        if let Some(tx) = self.conns.get(&conn) {
            tx.send(Outbound::Deliver(msg)).ok();
        }
    }

    fn broadcast_others(&self, exclude: u64, msg: ServerMsg) {
        for entry in self.conns.iter() {
            if *entry.key() != exclude {
                entry.value().send(Outbound::Deliver(msg.clone())).ok();
            }
        }
    }

    fn broadcast_all(&self, msg: ServerMsg) {
        for entry in self.conns.iter() {
            entry.value().send(Outbound::Deliver(msg.clone())).ok();
        }
    }

    fn kick(&self, conn: u64) {
        if let Some(tx) = self.conns.get(&conn) {
            tx.send(Outbound::Kick).ok();
        }
    }

    fn kick_all(&self) {
        for entry in self.conns.iter() {
            entry.value().send(Outbound::Kick).ok();
        }
    }
}

impl Coedit {
    /// Build the hub around a loaded document store.
    pub fn new(doc: DocumentStore, image_limits: ImageLimits) -> Self {
        Self {
            doc,
            sessions: Sessions::default(),
            image_limits,
            count: AtomicU64::new(0),
        }
    }

    /// The document store this hub mutates.
    pub fn document(&self) -> &DocumentStore {
        &self.doc
    }

    /// Serve one websocket connection until it closes.
    pub async fn on_connection(self: Arc<Self>, socket: WebSocket) {
        let conn = self.count.fetch_add(1, Ordering::Relaxed);
        info!("connection opened, conn = {}", conn);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.conns.insert(conn, tx);
        if let Err(e) = self.handle_connection(conn, socket, rx).await {
            warn!("connection {} closed: {:#}", conn, e);
        }
        self.sessions.conns.remove(&conn);
        self.disconnect(conn).await;
    }

    async fn handle_connection(
        self: &Arc<Self>,
        conn: u64,
        socket: WebSocket,
        mut rx: UnboundedReceiver<Outbound>,
    ) -> Result<()> {
        let (mut sink, mut stream) = socket.split();
        let mut ping = time::interval(PING_INTERVAL);
        let mut last_heard = Instant::now();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Outbound::Deliver(msg)) => sink.send(msg.into()).await?,
                    Some(Outbound::Kick) => {
                        sink.send(Message::Close(None)).await.ok();
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                message = stream.next() => match message {
                    None => return Ok(()),
                    Some(message) => {
                        last_heard = Instant::now();
                        match message? {
                            Message::Text(text) => match serde_json::from_str(&text) {
                                Ok(msg) => self.handle_message(conn, msg).await,
                                Err(e) => {
                                    warn!("ignoring malformed message on conn {}: {}", conn, e);
                                    // An identify missing required fields closes
                                    // the connection; anything else is dropped.
                                    let is_identify = serde_json::from_str::<serde_json::Value>(&text)
                                        .is_ok_and(|v| v.get("userJoined").is_some());
                                    if is_identify {
                                        bail!("malformed identify");
                                    }
                                }
                            },
                            Message::Close(_) => return Ok(()),
                            _ => {}
                        }
                    }
                },
                _ = ping.tick() => {
                    if last_heard.elapsed() > PING_INTERVAL + PING_TIMEOUT {
                        bail!("liveness timeout");
                    }
                    sink.send(Message::Ping(Bytes::new())).await?;
                }
            }
        }
    }

    /// Dispatch one inbound message.
    async fn handle_message(self: &Arc<Self>, conn: u64, message: ClientMsg) {
        match message {
            ClientMsg::UserJoined {
                user_id,
                name,
                color,
            } => self.identify(conn, user_id, name, color).await,
            ClientMsg::ApplyPatch { patch } => self.route_patch(conn, patch).await,
            ClientMsg::CursorMove {
                x,
                y,
                height,
                is_image,
            } => self.route_cursor(conn, x, y, height, is_image).await,
            ClientMsg::UploadImage {
                placeholder_id,
                base64_data,
            } => self.process_image(conn, placeholder_id, base64_data).await,
            ClientMsg::RequestFullSync { reason } => self.full_sync(conn, reason).await,
        }
    }

    /// Bind a connection to a logical user, taking over any previous
    /// connection that held the same ID.
    ///
    /// An identity with a short user ID or an empty name is dropped without
    /// registering a session; the connection stays open for a corrected
    /// retry.
    async fn identify(&self, conn: u64, user_id: String, name: String, color: String) {
        if user_id.len() < 5 {
            warn!("dropping identify on conn {}: user ID shorter than 5", conn);
            return;
        }
        if name.is_empty() {
            warn!("dropping identify on conn {}: empty user name", conn);
            return;
        }
        let (others, kicked) = {
            let mut bindings = self.sessions.bindings.lock().await;
            // Reconnect takeover: the previous holder of this ID is closed
            // without a userLeft, its binding removed before its socket
            // unwinds.
            let kicked = bindings
                .users
                .get(&user_id)
                .filter(|s| s.conn != conn)
                .map(|s| s.conn);
            if let Some(old) = kicked {
                bindings.by_conn.remove(&old);
            }
            // A connection re-identifying under a new ID sheds its old binding.
            if let Some(prev) = bindings.by_conn.insert(conn, user_id.clone())
                && prev != user_id
            {
                bindings.users.remove(&prev);
            }
            bindings.users.insert(
                user_id.clone(),
                Session {
                    conn,
                    name: name.clone(),
                    color: color.clone(),
                    last_seen: Instant::now(),
                },
            );
            let others = bindings
                .users
                .iter()
                .filter(|(id, _)| **id != user_id)
                .map(|(id, s)| {
                    (
                        id.clone(),
                        UserInfo {
                            name: s.name.clone(),
                            color: s.color.clone(),
                        },
                    )
                })
                .collect();
            (others, kicked)
        };
        if let Some(old) = kicked {
            info!("user {} reconnected, kicking conn {}", user_id, old);
            self.sessions.kick(old);
        }
        info!("user {} joined, conn = {}", user_id, conn);
        self.sessions.send_to(
            conn,
            ServerMsg::Init {
                content: self.doc.snapshot().await,
                users: others,
            },
        );
        self.sessions.broadcast_others(
            conn,
            ServerMsg::UserJoined {
                user_id,
                name,
                color,
            },
        );
    }

    /// Remove the departing connection's session, unless a takeover has
    /// already rebound the user to a newer connection.
    async fn disconnect(&self, conn: u64) {
        let departed = {
            let mut bindings = self.sessions.bindings.lock().await;
            match bindings.by_conn.remove(&conn) {
                Some(user_id)
                    if bindings
                        .users
                        .get(&user_id)
                        .is_some_and(|s| s.conn == conn) =>
                {
                    bindings.users.remove(&user_id);
                    Some(user_id)
                }
                _ => None,
            }
        };
        if let Some(user_id) = departed {
            info!("user {} left, conn = {}", user_id, conn);
            self.sessions.broadcast_all(ServerMsg::UserLeft { user_id });
        }
    }

    /// Apply an inbound patch and fan the accepted edit out to peers.
    async fn route_patch(&self, conn: u64, patch: String) {
        let Some(user_id) = self.resolve(conn).await else {
            return;
        };
        let sessions = &self.sessions;
        let outcome = self
            .doc
            .apply_patch_then(&patch, |size| {
                debug!("applied {} byte patch from {}, now {} bytes", patch.len(), user_id, size);
                // Dispatch under the document lock so every recipient sees
                // accepted patches in commit order.
                sessions.broadcast_others(
                    conn,
                    ServerMsg::ApplyPatch {
                        patch: patch.clone(),
                        sender_id: user_id.clone(),
                    },
                );
            })
            .await;
        match outcome {
            PatchOutcome::Applied(_) | PatchOutcome::NoChange => {
                sessions.send_to(conn, ServerMsg::ContentAcknowledged {});
            }
            PatchOutcome::Rejected(reason) => {
                warn!("rejected patch from {}: {}", user_id, reason);
                sessions.send_to(conn, ServerMsg::PatchRejected { reason });
            }
            PatchOutcome::Failed(reason) => {
                warn!("patch from {} failed to apply: {}", user_id, reason);
                sessions.send_to(conn, ServerMsg::RequestFullSync { reason });
            }
        }
    }

    /// Annotate a caret update with the sender's identity and fan it out.
    async fn route_cursor(&self, conn: u64, x: f64, y: f64, height: f64, is_image: bool) {
        if !(x.is_finite() && y.is_finite() && height.is_finite()) {
            return;
        }
        let annotated = {
            let mut bindings = self.sessions.bindings.lock().await;
            let Some(user_id) = bindings.by_conn.get(&conn).cloned() else {
                return;
            };
            let Some(session) = bindings.users.get_mut(&user_id) else {
                return;
            };
            session.last_seen = Instant::now();
            ServerMsg::CursorMove {
                user_id,
                name: session.name.clone(),
                color: session.color.clone(),
                x,
                y,
                height,
                is_image,
            }
        };
        self.sessions.broadcast_others(conn, annotated);
    }

    /// Optimize an uploaded image off the document path and reply to the
    /// submitter only, keyed by their placeholder.
    async fn process_image(self: &Arc<Self>, conn: u64, placeholder_id: String, base64_data: String) {
        if self.resolve(conn).await.is_none() {
            self.sessions.send_to(
                conn,
                ServerMsg::ImageProcessed {
                    placeholder_id,
                    optimized_base64: None,
                    error: Some("unidentified".to_string()),
                },
            );
            return;
        }
        let this = Arc::clone(self);
        let limits = self.image_limits.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || image::optimize_data_url(&base64_data, &limits))
                    .await;
            let msg = match result {
                Ok(Ok(optimized)) => ServerMsg::ImageProcessed {
                    placeholder_id,
                    optimized_base64: Some(optimized),
                    error: None,
                },
                Ok(Err(e)) => {
                    debug!("image {} not processed: {:#}", placeholder_id, e);
                    ServerMsg::ImageProcessed {
                        placeholder_id,
                        optimized_base64: None,
                        error: Some(format!("{e:#}")),
                    }
                }
                Err(e) => {
                    warn!("image task for {} panicked: {}", placeholder_id, e);
                    ServerMsg::ImageProcessed {
                        placeholder_id,
                        optimized_base64: None,
                        error: Some("image processing failed".to_string()),
                    }
                }
            };
            // The submitter may be gone by now; the reply is dropped with
            // their outbox.
            this.sessions.send_to(conn, msg);
        });
    }

    /// Re-send the full document to a client recovering from divergence.
    async fn full_sync(&self, conn: u64, reason: Option<String>) {
        let Some(user_id) = self.resolve(conn).await else {
            return;
        };
        info!(
            "full sync for {} ({})",
            user_id,
            reason.as_deref().unwrap_or("unspecified")
        );
        let users = self.list_others(&user_id).await;
        self.sessions.send_to(
            conn,
            ServerMsg::Init {
                content: self.doc.snapshot().await,
                users,
            },
        );
        self.sessions.send_to(conn, ServerMsg::ContentAcknowledged {});
    }

    async fn resolve(&self, conn: u64) -> Option<String> {
        self.sessions.bindings.lock().await.by_conn.get(&conn).cloned()
    }

    async fn list_others(&self, user_id: &str) -> HashMap<String, UserInfo> {
        self.sessions
            .bindings
            .lock()
            .await
            .users
            .iter()
            .filter(|(id, _)| *id != user_id)
            .map(|(id, s)| {
                (
                    id.clone(),
                    UserInfo {
                        name: s.name.clone(),
                        color: s.color.clone(),
                    },
                )
            })
            .collect()
    }

    /// Drop sessions whose connections vanished without a disconnect.
    pub(crate) async fn sweep_stale(&self) {
        let dead: Vec<(String, u64)> = {
            let mut bindings = self.sessions.bindings.lock().await;
            let dead: Vec<(String, u64)> = bindings
                .users
                .iter()
                .filter(|(_, s)| {
                    self.sessions
                        .conns
                        .get(&s.conn)
                        .is_none_or(|tx| tx.is_closed())
                })
                .map(|(id, s)| (id.clone(), s.conn))
                .collect();
            for (user_id, conn) in &dead {
                bindings.users.remove(user_id);
                bindings.by_conn.remove(conn);
                self.sessions.conns.remove(conn);
            }
            dead
        };
        for (user_id, conn) in dead {
            info!("sweeping stale session for {}, conn = {}", user_id, conn);
            self.sessions.broadcast_all(ServerMsg::UserLeft { user_id });
        }
    }

    /// Deliver a message to every open connection.
    pub(crate) fn broadcast_all(&self, msg: ServerMsg) {
        self.sessions.broadcast_all(msg);
    }

    /// Close every open connection.
    pub(crate) fn kick_all(&self) {
        self.sessions.kick_all();
    }
}

/// A message received from the client over the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    /// Identify this connection as a logical user.
    UserJoined {
        user_id: String,
        name: String,
        color: String,
    },
    /// An incremental edit to the shared document, as a unified diff.
    ApplyPatch { patch: String },
    /// An inline image to optimize, correlated by placeholder.
    UploadImage {
        placeholder_id: String,
        base64_data: String,
    },
    /// The sender's caret position in editor coordinates.
    CursorMove {
        x: f64,
        y: f64,
        height: f64,
        is_image: bool,
    },
    /// Ask for a fresh copy of the document.
    RequestFullSync {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// A message sent to the client over the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    /// The full document and current peers, sent on identify and full sync.
    Init {
        content: String,
        users: HashMap<String, UserInfo>,
    },
    /// An accepted edit from another user.
    ApplyPatch { patch: String, sender_id: String },
    /// The submitter's last edit is committed server-side.
    ContentAcknowledged {},
    /// The submitter's edit was refused without touching the document.
    PatchRejected { reason: String },
    /// The submitter has diverged and should request a full sync.
    RequestFullSync { reason: String },
    /// Outcome of an image upload, keyed by the submitter's placeholder.
    ImageProcessed {
        placeholder_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        optimized_base64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A peer's caret, annotated with their identity.
    CursorMove {
        user_id: String,
        name: String,
        color: String,
        x: f64,
        y: f64,
        height: f64,
        is_image: bool,
    },
    /// A peer joined the document.
    UserJoined {
        user_id: String,
        name: String,
        color: String,
    },
    /// A peer left the document.
    UserLeft { user_id: String },
    /// The server is going away.
    ServerShutdown { message: String },
}

/// Identity details shared with peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInfo {
    /// Display name chosen by the user.
    pub name: String,
    /// Caret color chosen by the user.
    pub color: String,
}

impl From<ServerMsg> for Message {
    fn from(msg: ServerMsg) -> Self {
        let serialized = serde_json::to_string(&msg).expect("failed serialize");
        Message::text(serialized)
    }
}

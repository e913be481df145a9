//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! ws://host/{doc_id}[?format=json]
//!
//! Client A ──┐                        ┌── DocumentStorage
//!             ├── Gateway ── Session ──┤     (RocksDB / memory)
//! Client B ──┘       │         │       └── debounced writes
//!                    │         └── broadcast ──► Client A, Client B
//!                    └── SessionRegistry (doc_id → Session)
//! ```
//!
//! The document id travels in the request path at handshake time. Requests
//! without one are refused with HTTP 400. Documents that do not exist are
//! refused after the upgrade with close code 4404.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::gateway::{Connection, Gateway};
use crate::protocol::{ProtocolError, SyncMessage, WireFormat};
use crate::registry::SessionRegistry;
use crate::session::{SessionConfig, SessionError};
use crate::stats::SyncStats;
use crate::storage::{DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Close code sent when the document does not exist.
pub const CLOSE_NOT_FOUND: u16 = 4404;
/// Close code sent when the session is at capacity.
pub const CLOSE_SESSION_FULL: u16 = 4429;

const DEFAULT_DOCUMENT_NAME: &str = "Untitled";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Quiet period before a changed document is written
    pub quiescence: Duration,
    /// Maximum connections per document
    pub max_members_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Documents created at startup if missing, as `(doc_id, name)`
    pub seed_documents: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            quiescence: Duration::from_secs(2),
            max_members_per_session: 100,
            broadcast_capacity: 256,
            storage_path: None,
            seed_documents: Vec::new(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: String,
    pub value: String,
}

impl ServerConfig {
    /// Defaults overridden by `QUIRE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `QUIRE_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError {
                var: var.to_string(),
                value,
            })
        }

        let mut config = Self::default();
        if let Some(addr) = lookup("QUIRE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("QUIRE_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = lookup("QUIRE_QUIESCENCE_MS") {
            config.quiescence = Duration::from_millis(parse("QUIRE_QUIESCENCE_MS", ms)?);
        }
        if let Some(max) = lookup("QUIRE_MAX_MEMBERS") {
            config.max_members_per_session = parse("QUIRE_MAX_MEMBERS", max)?;
        }
        if let Some(cap) = lookup("QUIRE_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse("QUIRE_BROADCAST_CAPACITY", cap)?;
        }
        if let Some(docs) = lookup("QUIRE_SEED_DOCS") {
            config.seed_documents = parse_seed_documents(&docs).ok_or(ConfigError {
                var: "QUIRE_SEED_DOCS".to_string(),
                value: docs,
            })?;
        }
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            quiescence: self.quiescence,
            broadcast_capacity: self.broadcast_capacity,
            max_members: self.max_members_per_session,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub ignored_messages: u64,
    pub active_sessions: usize,
    pub sync: SyncStats,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server over an existing storage backend.
    pub fn new(config: ServerConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        let registry = SessionRegistry::new(storage, config.session_config());
        Self {
            config,
            gateway: Arc::new(Gateway::new(Arc::new(registry))),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Create a server with RocksDB at `storage_path`, or in-memory storage.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let storage: Arc<dyn DocumentStorage> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, storage))
    }

    /// Bind the configured address. Port 0 picks a free port.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    ///
    /// Returns after `shutdown`: stops accepting, closes every live socket,
    /// waits for their sessions to tear down, then flushes what is left.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let gateway = self.gateway.clone();
                    let stats = self.stats.clone();
                    let shutdown = self.shutdown.subscribe();

                    connections.spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, gateway, stats, shutdown).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {}
            }
        }

        drop(listener);
        log::info!("Closing {} connections", connections.len());
        while connections.join_next().await.is_some() {}

        let failed = self.gateway.registry().flush_all().await;
        if failed > 0 {
            log::error!("{failed} sessions failed to flush on shutdown");
        }
        log::info!("Sync server stopped");
        Ok(())
    }

    /// Ask `serve` to stop. Returns immediately; `serve` completes once every
    /// connection has closed and its session has been written.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Create each configured seed document that does not exist yet.
    /// Returns how many were created.
    pub async fn seed_documents(&self) -> Result<usize, SessionError> {
        let mut created = 0;
        for (doc_id, name) in &self.config.seed_documents {
            if self.create_document(doc_id, name).await? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Create a document unless it exists. Returns whether it was created.
    pub async fn create_document(&self, doc_id: &str, name: &str) -> Result<bool, SessionError> {
        if doc_id.trim().is_empty() {
            return Err(SessionError::InvalidDocumentId(doc_id.to_string()));
        }
        self.gateway.registry().create_document(doc_id, name).await
    }

    /// Delete a document. Fails with `DocumentInUse` while anyone is connected.
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool, SessionError> {
        self.gateway.registry().delete_document(doc_id).await
    }

    pub async fn list_documents(&self) -> Result<Vec<String>, SessionError> {
        self.gateway.registry().list_documents().await
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        stats: Arc<RwLock<ServerStats>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let mut route: Option<(String, WireFormat)> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                match parse_route(req.uri()) {
                    Some(parsed) => {
                        route = Some(parsed);
                        Ok(resp)
                    }
                    None => Err(reject(StatusCode::BAD_REQUEST, "missing document id in path")),
                }
            },
        )
        .await?;

        let Some((doc_id, format)) = route else {
            return Err("handshake completed without a route".into());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.write().await.total_connections += 1;

        let mut conn = match gateway.on_connect(&doc_id).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Rejecting {addr} for doc {doc_id}: {e}");
                stats.write().await.rejected_connections += 1;
                let frame = CloseFrame {
                    code: close_code(&e),
                    reason: close_reason(&e).to_string().into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        {
            let mut s = stats.write().await;
            s.active_connections += 1;
            s.active_sessions = gateway.registry().session_count().await;
        }
        log::info!("WebSocket {addr} attached to doc {doc_id} as {}", conn.id());

        let outcome = Self::pump(
            &gateway,
            &mut conn,
            &mut ws_sender,
            &mut ws_receiver,
            format,
            &stats,
            &mut shutdown,
        )
        .await;

        gateway.on_disconnect(conn).await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_sessions = gateway.registry().session_count().await;
        }
        outcome
    }

    /// Shuttle frames between one socket and its session until either side ends.
    async fn pump(
        gateway: &Gateway,
        conn: &mut Connection,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        format: WireFormat,
        stats: &RwLock<ServerStats>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        if let Some(snapshot) = conn.take_snapshot() {
            ws_sender.send(encode(&snapshot, format)?).await?;
        }

        loop {
            if *shutdown.borrow() {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                log::debug!("Closed connection {} for shutdown", conn.id());
                return Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // Sender gone means the server itself is gone.
                    if changed.is_err() {
                        return Ok(());
                    }
                }

                inbound = ws_receiver.next() => {
                    let decoded = match inbound {
                        Some(Ok(Message::Binary(data))) => SyncMessage::decode_binary(&data),
                        Some(Ok(Message::Text(text))) => SyncMessage::decode_json(text.as_str()),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection {} closed", conn.id());
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    match decoded {
                        Ok(message) => {
                            stats.write().await.total_messages += 1;
                            if let Some(reply) = gateway.on_message(conn, message).await {
                                ws_sender.send(encode(&reply, format)?).await?;
                            }
                        }
                        Err(ProtocolError::UnknownEvent(kind)) => {
                            stats.write().await.ignored_messages += 1;
                            log::debug!("Ignoring unknown event {kind:?} from {}", conn.id());
                        }
                        Err(e) => {
                            stats.write().await.ignored_messages += 1;
                            log::warn!("Failed to decode message from {}: {e}", conn.id());
                        }
                    }
                }

                outbound = conn.next_outbound() => {
                    match outbound {
                        Some(message) => ws_sender.send(encode(&message, format)?).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.gateway.registry().session_count().await;
        stats.sync = self.gateway.registry().stats();
        stats
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

/// First path segment is the document id; `format=json` selects JSON frames.
fn parse_route(uri: &Uri) -> Option<(String, WireFormat)> {
    let doc_id = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())?;
    Some((doc_id.to_string(), WireFormat::from_query(uri.query())))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn encode(message: &SyncMessage, format: WireFormat) -> Result<Message, ProtocolError> {
    Ok(match format {
        WireFormat::Binary => Message::Binary(message.encode_binary()?.into()),
        WireFormat::Json => Message::Text(message.encode_json()?.into()),
    })
}

fn close_code(error: &SessionError) -> CloseCode {
    match error {
        SessionError::NotFound(_) => CloseCode::from(CLOSE_NOT_FOUND),
        SessionError::SessionFull { .. } => CloseCode::from(CLOSE_SESSION_FULL),
        SessionError::InvalidDocumentId(_) | SessionError::DocumentInUse(_) => CloseCode::Policy,
        SessionError::Storage(_) => CloseCode::Error,
    }
}

fn close_reason(error: &SessionError) -> &'static str {
    match error {
        SessionError::NotFound(_) => "document not found",
        SessionError::SessionFull { .. } => "session full",
        SessionError::InvalidDocumentId(_) => "invalid document id",
        SessionError::DocumentInUse(_) => "document in use",
        SessionError::Storage(_) => "storage unavailable",
    }
}

/// `id[=Name],id2,...`; a missing name defaults to "Untitled".
fn parse_seed_documents(value: &str) -> Option<Vec<(String, String)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, name) = entry.split_once('=').unwrap_or((entry, DEFAULT_DOCUMENT_NAME));
            let (id, name) = (id.trim(), name.trim());
            let name = if name.is_empty() { DEFAULT_DOCUMENT_NAME } else { name };
            (!id.is_empty()).then(|| (id.to_string(), name.to_string()))
        })
        .collect()
}

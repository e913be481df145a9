//! WebSocket sync client.
//!
//! Keeps a local mirror of the document's name and content:
//! - the attach snapshot replaces the mirror wholesale
//! - remote changes overwrite the content
//! - renames overwrite the name (including our own, on echo)
//! - local changes update the mirror before they are sent

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{DocumentContent, ProtocolError, SyncMessage, WireFormat};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// WebSocket handshake completed
    Connected,
    /// Attach-time state of the document
    Snapshot {
        name: String,
        content: DocumentContent,
    },
    /// Another connection replaced the content
    RemoteChange(DocumentContent),
    /// Someone (possibly us) renamed the document
    Renamed(String),
    Pong,
    /// Server closed the connection with an error code
    Rejected { code: u16, reason: String },
    /// Connection lost
    Disconnected,
}

#[derive(Debug, Default)]
struct Mirror {
    name: String,
    content: DocumentContent,
}

/// The sync client.
pub struct SyncClient {
    /// Document we're editing
    doc_id: String,

    /// Server URL, without the document path
    server_url: String,

    format: WireFormat,

    state: Arc<RwLock<ConnectionState>>,

    mirror: Arc<RwLock<Mirror>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<SyncMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            doc_id: doc_id.into(),
            server_url: server_url.into(),
            format: WireFormat::Binary,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            mirror: Arc::new(RwLock::new(Mirror::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Use `format` for frames in both directions. Takes effect on connect.
    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// `ws://host/{doc_id}`, plus `?format=json` for JSON frames.
    pub fn url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        match self.format {
            WireFormat::Binary => format!("{base}/{}", self.doc_id),
            WireFormat::Json => format!("{base}/{}?format=json", self.doc_id),
        }
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.url();
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer: drain the channel, then close the socket once every sender is gone.
        let format = self.format;
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let frame = match format {
                    WireFormat::Binary => message.encode_binary().map(|b| Message::Binary(b.into())),
                    WireFormat::Json => message.encode_json().map(|t| Message::Text(t.into())),
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping unencodable message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let mirror = self.mirror.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Binary(data)) => SyncMessage::decode_binary(&data),
                    Ok(Message::Text(text)) => SyncMessage::decode_json(text.as_str()),
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame.filter(|f| f.code != CloseCode::Normal) {
                            let _ = event_tx
                                .send(SyncEvent::Rejected {
                                    code: u16::from(frame.code),
                                    reason: frame.reason.to_string(),
                                })
                                .await;
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("WebSocket read failed: {e}");
                        break;
                    }
                };

                let event = match decoded {
                    Ok(SyncMessage::Snapshot { name, content }) => {
                        let mut m = mirror.write().await;
                        m.name = name.clone();
                        m.content = content.clone();
                        SyncEvent::Snapshot { name, content }
                    }
                    Ok(SyncMessage::Change(content)) => {
                        mirror.write().await.content = content.clone();
                        SyncEvent::RemoteChange(content)
                    }
                    Ok(SyncMessage::Rename(name)) => {
                        mirror.write().await.name = name.clone();
                        SyncEvent::Renamed(name)
                    }
                    Ok(SyncMessage::Pong) => SyncEvent::Pong,
                    Ok(SyncMessage::Ping) => continue,
                    Err(e) => {
                        log::debug!("Ignoring undecodable frame: {e}");
                        continue;
                    }
                };
                let _ = event_tx.send(event).await;
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Replace the document content. The local mirror updates immediately.
    pub async fn change(&self, content: DocumentContent) -> Result<(), ProtocolError> {
        let tx = self.sender().await?;
        self.mirror.write().await.content = content.clone();
        tx.send(SyncMessage::Change(content))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Rename the document. The local name changes when the server echoes it.
    pub async fn rename(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self.sender().await?;
        tx.send(SyncMessage::Rename(name.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        let tx = self.sender().await?;
        tx.send(SyncMessage::Ping)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Queued messages are still sent first.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn sender(&self) -> Result<&mpsc::Sender<SyncMessage>, ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Mirrored document name.
    pub async fn name(&self) -> String {
        self.mirror.read().await.name.clone()
    }

    /// Mirrored document content.
    pub async fn content(&self) -> DocumentContent {
        self.mirror.read().await.content.clone()
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }
}

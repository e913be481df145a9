//! Wire protocol for whole-document synchronization.
//!
//! Two encodings share one message model:
//!
//! Binary (default, bincode-encoded):
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ kind     │ payload                      │
//! │ 1 byte   │ bincode body (kind-specific) │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! JSON (text frames, selected with `?format=json`):
//! ```text
//! {"event":"change","data":[{"index":0,"text":"hello"}]}
//! {"event":"rename","data":"Notes"}
//! ```
//!
//! Content is always sent whole; there is no delta format.

use serde::{Deserialize, Serialize};

/// A single line of document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub index: u32,
    pub text: String,
}

impl Line {
    pub fn new(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Ordered document body. Treated as an opaque, replaceable value.
pub type DocumentContent = Vec<Line>;

/// Build dense `0..n` content from plain text lines.
///
/// Line indices are `u32`; input past `u32::MAX + 1` lines is not
/// representable and is dropped rather than wrapped.
pub fn content_from_lines<I, S>(lines: I) -> DocumentContent
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    lines
        .into_iter()
        .zip(0..=u32::MAX)
        .map(|(text, index)| Line::new(index, text))
        .collect()
}

/// Message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Whole-document replacement
    Change = 1,
    /// Document title update
    Rename = 2,
    /// Authoritative state sent once at attach
    Snapshot = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Change),
            2 => Some(Self::Rename),
            3 => Some(Self::Snapshot),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Event name used by the JSON encoding.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Rename => "rename",
            Self::Snapshot => "snapshot",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "change" => Some(Self::Change),
            "rename" => Some(Self::Rename),
            "snapshot" => Some(Self::Snapshot),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Top-level protocol message, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Change(DocumentContent),
    Rename(String),
    Snapshot {
        name: String,
        content: DocumentContent,
    },
    Ping,
    Pong,
}

/// Encoding negotiated for a connection at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

impl WireFormat {
    /// Pick the format from a connect URL query string (`format=json`).
    pub fn from_query(query: Option<&str>) -> Self {
        let wants_json = query
            .map(|q| {
                q.split('&')
                    .any(|pair| pair.eq_ignore_ascii_case("format=json"))
            })
            .unwrap_or(false);
        if wants_json {
            Self::Json
        } else {
            Self::Binary
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Frame {
    kind: u8,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    name: String,
    content: DocumentContent,
}

#[derive(Serialize, Deserialize)]
struct JsonEvent {
    event: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    data: serde_json::Value,
}

fn to_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_bincode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Change(_) => MessageType::Change,
            Self::Rename(_) => MessageType::Rename,
            Self::Snapshot { .. } => MessageType::Snapshot,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Self::Change(content) => to_bincode(content)?,
            Self::Rename(name) => to_bincode(name)?,
            Self::Snapshot { name, content } => to_bincode(&SnapshotBody {
                name: name.clone(),
                content: content.clone(),
            })?,
            Self::Ping | Self::Pong => Vec::new(),
        };
        to_bincode(&Frame {
            kind: self.message_type() as u8,
            payload,
        })
    }

    /// Deserialize from the binary wire format.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let frame: Frame = from_bincode(bytes)?;
        let kind = MessageType::from_u8(frame.kind)
            .ok_or_else(|| ProtocolError::UnknownEvent(frame.kind.to_string()))?;
        Ok(match kind {
            MessageType::Change => Self::Change(from_bincode(&frame.payload)?),
            MessageType::Rename => Self::Rename(from_bincode(&frame.payload)?),
            MessageType::Snapshot => {
                let body: SnapshotBody = from_bincode(&frame.payload)?;
                Self::Snapshot {
                    name: body.name,
                    content: body.content,
                }
            }
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode_json(&self) -> Result<String, ProtocolError> {
        let data = match self {
            Self::Change(content) => serde_json::to_value(content),
            Self::Rename(name) => serde_json::to_value(name),
            Self::Snapshot { name, content } => serde_json::to_value(SnapshotBody {
                name: name.clone(),
                content: content.clone(),
            }),
            Self::Ping | Self::Pong => Ok(serde_json::Value::Null),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        serde_json::to_string(&JsonEvent {
            event: self.message_type().event_name().to_string(),
            data,
        })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode_json(text: &str) -> Result<Self, ProtocolError> {
        let event: JsonEvent = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let kind = MessageType::from_event_name(&event.event)
            .ok_or(ProtocolError::UnknownEvent(event.event))?;

        let de = |e: serde_json::Error| ProtocolError::Deserialization(e.to_string());
        Ok(match kind {
            MessageType::Change => Self::Change(serde_json::from_value(event.data).map_err(de)?),
            MessageType::Rename => Self::Rename(serde_json::from_value(event.data).map_err(de)?),
            MessageType::Snapshot => {
                let body: SnapshotBody = serde_json::from_value(event.data).map_err(de)?;
                Self::Snapshot {
                    name: body.name,
                    content: body.content,
                }
            }
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown event kind: {0}")]
    UnknownEvent(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_binary_roundtrip() {
        let content = content_from_lines(["hello", "world"]);
        let msg = SyncMessage::Change(content.clone());

        let encoded = msg.encode_binary().unwrap();
        let decoded = SyncMessage::decode_binary(&encoded).unwrap();

        assert_eq!(decoded, SyncMessage::Change(content));
    }

    #[test]
    fn test_snapshot_binary_roundtrip() {
        let msg = SyncMessage::Snapshot {
            name: "Notes".into(),
            content: vec![Line::new(0, "a"), Line::new(3, "sparse index kept")],
        };
        let decoded = SyncMessage::decode_binary(&msg.encode_binary().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_change_json_shape() {
        let msg = SyncMessage::Change(vec![Line::new(0, "hello")]);
        let json = msg.encode_json().unwrap();
        assert_eq!(json, r#"{"event":"change","data":[{"index":0,"text":"hello"}]}"#);
    }

    #[test]
    fn test_rename_json_decode() {
        let msg = SyncMessage::decode_json(r#"{"event":"rename","data":"Notes"}"#).unwrap();
        assert_eq!(msg, SyncMessage::Rename("Notes".into()));
    }

    #[test]
    fn test_ping_json_has_no_data() {
        let json = SyncMessage::Ping.encode_json().unwrap();
        assert_eq!(json, r#"{"event":"ping"}"#);
        assert_eq!(SyncMessage::decode_json(&json).unwrap(), SyncMessage::Ping);
    }

    #[test]
    fn test_unknown_json_event() {
        let err = SyncMessage::decode_json(r#"{"event":"cursor","data":{"x":1}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("cursor".into()));
    }

    #[test]
    fn test_unknown_binary_kind() {
        let bytes = to_bincode(&Frame {
            kind: 42,
            payload: vec![1, 2, 3],
        })
        .unwrap();
        let err = SyncMessage::decode_binary(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("42".into()));
    }

    #[test]
    fn test_malformed_change_body() {
        let err = SyncMessage::decode_json(r#"{"event":"change","data":"not lines"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode_binary(&garbage).is_err());
    }

    #[test]
    fn test_wire_format_from_query() {
        assert_eq!(WireFormat::from_query(None), WireFormat::Binary);
        assert_eq!(WireFormat::from_query(Some("format=json")), WireFormat::Json);
        assert_eq!(WireFormat::from_query(Some("a=1&format=json")), WireFormat::Json);
        assert_eq!(WireFormat::from_query(Some("format=binary")), WireFormat::Binary);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Change as u8, 1);
        assert_eq!(MessageType::Rename as u8, 2);
        assert_eq!(MessageType::Snapshot as u8, 3);
        assert_eq!(MessageType::Ping as u8, 4);
        assert_eq!(MessageType::Pong as u8, 5);
        assert_eq!(MessageType::from_u8(0), None);
    }

    #[test]
    fn test_content_from_lines_is_dense() {
        let content = content_from_lines(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let indices: Vec<u32> = content.iter().map(|l| l.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_content_from_lines_accepts_lazy_input() {
        let content = content_from_lines((0..1000).map(|i| format!("line {i}")));
        assert_eq!(content.len(), 1000);
        assert_eq!(content[999], Line::new(999, "line 999"));
        assert!(content.iter().zip(0u32..).all(|(line, i)| line.index == i));
    }
}

use serde::{Deserialize, Serialize};

use crate::entities::{Orb, Pickup, Reward};
use crate::geometry::{Rect, Vec2};
use crate::participant::ParticipantId;
use crate::time::Millis;

/// Current protocol version. Clients reporting another version are refused at identify.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024; // 16 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::PayloadTooLarge(size) => {
                write!(
                    f,
                    "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})"
                )
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Inbound participant messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Signed identity claim over the nonce sent in `welcome`.
    Identify {
        address: String,
        signature: String,
        #[serde(default)]
        name: Option<String>,
        version: u32,
    },
    JoinRoom,
    UpdateSelf {
        position: Vec2,
        target: Vec2,
        /// Client clock at send time, echoed back for latency sampling.
        #[serde(default)]
        sent_at: Option<Millis>,
    },
    Spectate,
}

/// Public view of a participant in a join snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub name: String,
    pub level: u32,
    pub position: Vec2,
    pub target: Vec2,
    pub score: u64,
}

/// World state sent once to a joining participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub round: u64,
    pub mode: String,
    pub guide: String,
    /// Round end on the world clock; `None` while paused.
    pub ends_at: Option<Millis>,
    pub remaining_ms: u64,
    pub world_bounds: Rect,
    pub participants: Vec<ParticipantView>,
    pub pickups: Vec<Pickup>,
    pub orbs: Vec<Orb>,
    pub reward: Option<Reward>,
}

/// Direct (unicast) messages. These bypass the shared event batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        id: ParticipantId,
        nonce: String,
        version: u32,
    },
    Identified {
        id: ParticipantId,
        name: String,
    },
    Joined {
        id: ParticipantId,
        level: u32,
        energy: f32,
        position: Vec2,
        snapshot: Box<Snapshot>,
    },
    Loadout {
        speed: f32,
        zoom: f32,
    },
    Info {
        message: String,
    },
    Kicked {
        reason: String,
    },
}

/// Decode an inbound text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

/// Encode a direct message as a text frame.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Encode a client message. Used by test clients and tools.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_update_self() {
        let raw = r#"{"type":"update-self","position":{"x":1.0,"y":2.0},"target":{"x":3.0,"y":4.0}}"#;
        let msg = decode_client_message(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpdateSelf {
                position: Vec2::new(1.0, 2.0),
                target: Vec2::new(3.0, 4.0),
                sent_at: None,
            }
        );
    }

    #[test]
    fn decode_unit_variants() {
        assert_eq!(
            decode_client_message(r#"{"type":"join-room"}"#).unwrap(),
            ClientMessage::JoinRoom
        );
        assert_eq!(
            decode_client_message(r#"{"type":"spectate"}"#).unwrap(),
            ClientMessage::Spectate
        );
    }

    #[test]
    fn empty_message_errors() {
        assert!(matches!(
            decode_client_message(""),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn oversized_message_errors() {
        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            decode_client_message(&big),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn unknown_type_errors() {
        assert!(matches!(
            decode_client_message(r#"{"type":"teleport"}"#),
            Err(ProtocolError::DeserializeError(_))
        ));
    }

    #[test]
    fn server_message_is_type_tagged() {
        let json = encode_server_message(&ServerMessage::Kicked {
            reason: "idle".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"kicked","reason":"idle"}"#);
    }

    #[test]
    fn identify_roundtrip_keeps_fields() {
        let msg = ClientMessage::Identify {
            address: "addr".to_string(),
            signature: "sig".to_string(),
            name: Some("ada".to_string()),
            version: PROTOCOL_VERSION,
        };
        let text = encode_client_message(&msg).unwrap();
        assert!(text.contains(r#""type":"identify""#));
        assert_eq!(decode_client_message(&text).unwrap(), msg);
    }
}

//! Signaling wire format: one JSON object per WebSocket text frame,
//! discriminated by its `event` field.

use crate::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Room joined when a `join` names no room.
pub const DEFAULT_ROOM: &str = "default";

/// Longest accepted room name, in bytes.
pub const MAX_ROOM_NAME_LEN: usize = 128;

/// Position of a session within its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationKind {
    Offer,
    Answer,
    IceCandidate,
}

/// An offer, answer or ICE candidate. `data` is kept as the sender's raw
/// JSON text and is never interpreted.
#[derive(Debug, Clone, Serialize)]
pub struct Negotiation {
    #[serde(rename = "type")]
    pub kind: NegotiationKind,
    pub data: Box<RawValue>,
}

/// Events a peer sends to the server.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Join { room: String },
    Negotiation(Negotiation),
    Leave,
}

/// Events the server sends to a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    Joined { room: String, role: Role },
    PeerJoined {},
    PeerLeft {},
    Negotiation(Negotiation),
    Error { kind: ErrorKind, message: String },
}

impl ServerEvent {
    pub fn error(err: &AppError) -> Self {
        ServerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    room: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<NegotiationKind>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

impl ClientEvent {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let frame: InboundFrame = serde_json::from_str(text)
            .map_err(|e| AppError::invalid(format!("malformed event: {}", e)))?;

        match frame.event.as_str() {
            "join" => {
                let room = frame
                    .room
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
                if room.len() > MAX_ROOM_NAME_LEN {
                    return Err(AppError::invalid("room name too long"));
                }
                Ok(ClientEvent::Join { room })
            }
            "negotiation" | "signal" => {
                let kind = frame
                    .kind
                    .ok_or_else(|| AppError::invalid("negotiation requires a type"))?;
                let data = match frame.data {
                    Some(data) => data,
                    None => RawValue::from_string("null".to_string())
                        .map_err(|e| AppError::invalid(e.to_string()))?,
                };
                Ok(ClientEvent::Negotiation(Negotiation { kind, data }))
            }
            "leave" => Ok(ClientEvent::Leave),
            other => Err(AppError::invalid(format!("unknown event {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_defaults_room() {
        match ClientEvent::parse(r#"{"event":"join","room":" lobby "}"#).unwrap() {
            ClientEvent::Join { room } => assert_eq!(room, "lobby"),
            other => panic!("unexpected {:?}", other),
        }
        match ClientEvent::parse(r#"{"event":"join"}"#).unwrap() {
            ClientEvent::Join { room } => assert_eq!(room, DEFAULT_ROOM),
            other => panic!("unexpected {:?}", other),
        }
        let long = format!(r#"{{"event":"join","room":"{}"}}"#, "r".repeat(MAX_ROOM_NAME_LEN + 1));
        assert!(ClientEvent::parse(&long).is_err());
    }

    #[test]
    fn test_negotiation_data_kept_verbatim() {
        let raw = r#"{"sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1","n": 1.50 ,"x":[ ]}"#;
        let frame = format!(r#"{{"event":"negotiation","type":"offer","data":{}}}"#, raw);
        let negotiation = match ClientEvent::parse(&frame).unwrap() {
            ClientEvent::Negotiation(n) => n,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(negotiation.kind, NegotiationKind::Offer);
        assert_eq!(negotiation.data.get(), raw);

        let out = serde_json::to_string(&ServerEvent::Negotiation(negotiation)).unwrap();
        assert_eq!(
            out,
            format!(r#"{{"event":"negotiation","type":"offer","data":{}}}"#, raw)
        );
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        for frame in [
            "not json",
            r#"{"room":"a"}"#,
            r#"{"event":"dance"}"#,
            r#"{"event":"negotiation","data":{}}"#,
            r#"{"event":"negotiation","type":"bye","data":{}}"#,
        ] {
            let err = ClientEvent::parse(frame).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "frame {}", frame);
        }
    }

    #[test]
    fn test_server_events_serialize() {
        let joined = ServerEvent::Joined {
            room: "a".to_string(),
            role: Role::Second,
        };
        assert_eq!(
            serde_json::to_string(&joined).unwrap(),
            r#"{"event":"joined","room":"a","role":"second"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerEvent::PeerLeft {}).unwrap(),
            r#"{"event":"peer-left"}"#
        );
        let err = ServerEvent::error(&AppError::RoomFull("a".to_string()));
        let value: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["kind"], "room-full");
    }
}

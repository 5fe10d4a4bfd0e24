//! Binary signaling protocol carried over the peer WebSocket.
//!
//! Wire format (bincode-encoded `SignalFrame`, one frame per WebSocket
//! binary message):
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ variant  │ fields (varint lengths, UTF-8 strings)   │
//! │ varint   │ variable                                 │
//! └──────────┴──────────────────────────────────────────┘
//! ```
//!
//! Handshake:
//! ```text
//! caller                         callee
//!   │ ── Hello ──────────────────► │
//!   │ ◄──────────── Welcome/Reject │
//!   │ ── Offer (gathered SDP) ───► │
//!   │ ◄────────────────── Answer   │
//!   │      … data channel open …   │
//!   │ ◄──── Offer/Answer ────────► │  (renegotiation for audio)
//!   │ ◄──── Hangup / Bye ────────► │
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bumped whenever a frame layout changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Label of the text data channel opened by the caller.
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// Reject reasons sent in [`SignalFrame::Reject`].
pub const REJECT_SELF: &str = "self-connection is not allowed";
pub const REJECT_DUPLICATE: &str = "already connected";
pub const REJECT_VERSION: &str = "unsupported protocol version";

/// One signaling frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalFrame {
    /// First frame from the connecting side.
    Hello {
        version: u16,
        instance_id: Uuid,
        name: String,
        /// Signaling port the caller itself listens on; together with the
        /// TCP source address it forms the caller's peer key.
        listen_port: u16,
    },
    /// Callee accepted the Hello.
    Welcome { instance_id: Uuid, name: String },
    /// Callee refused the Hello; the socket closes afterwards.
    Reject { reason: String },
    /// Session description offer with all ICE candidates gathered.
    Offer { sdp: String },
    /// Session description answer with all ICE candidates gathered.
    Answer { sdp: String },
    /// Sender removed its outgoing audio track.
    Hangup,
    /// Sender is closing the connection.
    Bye,
}

impl SignalFrame {
    pub fn hello(instance_id: Uuid, name: impl Into<String>, listen_port: u16) -> Self {
        Self::Hello {
            version: PROTOCOL_VERSION,
            instance_id,
            name: name.into(),
            listen_port,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Reject { .. } => "reject",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Hangup => "hangup",
            Self::Bye => "bye",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedFrame(&'static str),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(kind) => write!(f, "Unexpected {kind} frame"),
            Self::ConnectionClosed => write!(f, "Signaling connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let id = Uuid::new_v4();
        let frame = SignalFrame::hello(id, "RytonIDE Peer_alpha", 9090);
        let decoded = SignalFrame::decode(&frame.encode().unwrap()).unwrap();

        match decoded {
            SignalFrame::Hello {
                version,
                instance_id,
                name,
                listen_port,
            } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert_eq!(instance_id, id);
                assert_eq!(name, "RytonIDE Peer_alpha");
                assert_eq!(listen_port, 9090);
            }
            other => panic!("Expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn test_offer_keeps_sdp_verbatim() {
        let sdp = "v=0\r\no=- 4611 2 IN IP4 127.0.0.1\r\na=candidate:1 1 udp 2130706431 10.0.0.5 50000 typ host\r\n";
        let frame = SignalFrame::Offer { sdp: sdp.to_string() };
        let decoded = SignalFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unit_frames_are_tiny() {
        for frame in [SignalFrame::Hangup, SignalFrame::Bye] {
            let encoded = frame.encode().unwrap();
            assert!(encoded.len() <= 2, "{} encoded to {} bytes", frame.kind(), encoded.len());
            assert_eq!(SignalFrame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_reject_reason() {
        let frame = SignalFrame::reject(REJECT_SELF);
        assert_eq!(
            SignalFrame::decode(&frame.encode().unwrap()).unwrap(),
            SignalFrame::Reject {
                reason: "self-connection is not allowed".into()
            }
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SignalFrame::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_frame_kinds() {
        assert_eq!(SignalFrame::Bye.kind(), "bye");
        assert_eq!(SignalFrame::Answer { sdp: String::new() }.kind(), "answer");
        assert_eq!(
            SignalFrame::Welcome {
                instance_id: Uuid::nil(),
                name: String::new()
            }
            .kind(),
            "welcome"
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ProtocolError::ConnectionClosed.to_string(), "Signaling connection closed");
        assert_eq!(
            ProtocolError::UnexpectedFrame("offer").to_string(),
            "Unexpected offer frame"
        );
    }
}

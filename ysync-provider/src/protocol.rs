//! Binary wire protocol shared by the provider, its peers and the relay.
//!
//! Wire format (lib0 variable-length encoding, no framing beyond the
//! transport's own message boundaries):
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ varUint tag  │ payload                                      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ 0 Sync       │ varUint step • varUint8Array(data)           │
//! │ 1 Awareness  │ varUint8Array(awareness update)              │
//! │ 2 Auth       │ varUint reason-kind • varString(reason)      │
//! │ 3 QueryAw.   │ (empty)                                      │
//! │ 4 Custom     │ varString(target) • varString(payload)       │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Tags must match across clients and servers. Sync steps follow the
//! y-protocols numbering (0 = step 1, 1 = step 2, 2 = update).

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::error::{Result, SyncError};

/// Frame tags for the top-level message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Document sync frame (step 1 / step 2 / update)
    Sync = 0,
    /// Awareness update blob
    Awareness = 1,
    /// Authorization outcome
    Auth = 2,
    /// Request for the peer's full awareness snapshot
    QueryAwareness = 3,
    /// Application-level point-to-point message
    Custom = 4,
}

impl MessageKind {
    /// Resolve a wire tag. Returns `None` for tags this protocol doesn't know.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            2 => Some(Self::Auth),
            3 => Some(Self::QueryAwareness),
            4 => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn tag(self) -> u64 {
        self as u64
    }
}

/// Sub-step of a sync frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Step1,
    Step2,
    Update,
}

impl SyncStep {
    fn tag(self) -> u64 {
        match self {
            SyncStep::Step1 => 0,
            SyncStep::Step2 => 1,
            SyncStep::Update => 2,
        }
    }
}

/// Document sync frame. Payloads are opaque to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    /// Encoded state vector of the sender; the receiver answers with step 2.
    Step1(Vec<u8>),
    /// Everything the requester is missing.
    Step2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

impl SyncFrame {
    pub fn step(&self) -> SyncStep {
        match self {
            SyncFrame::Step1(_) => SyncStep::Step1,
            SyncFrame::Step2(_) => SyncStep::Step2,
            SyncFrame::Update(_) => SyncStep::Update,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncFrame::Step1(data) | SyncFrame::Step2(data) | SyncFrame::Update(data) => data,
        }
    }
}

/// Auth frame. Only denial is defined by the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFrame {
    PermissionDenied { reason: String },
}

const AUTH_PERMISSION_DENIED: u64 = 0;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncFrame),
    Awareness(Vec<u8>),
    Auth(AuthFrame),
    QueryAwareness,
    Custom { target: String, payload: String },
}

impl Message {
    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncFrame::Step1(state_vector))
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(update: Vec<u8>) -> Self {
        Message::Sync(SyncFrame::Step2(update))
    }

    /// Create an incremental document update message.
    pub fn update(update: Vec<u8>) -> Self {
        Message::Sync(SyncFrame::Update(update))
    }

    /// Create an awareness update message.
    pub fn awareness(update: Vec<u8>) -> Self {
        Message::Awareness(update)
    }

    /// Create a permission denied message.
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Message::Auth(AuthFrame::PermissionDenied {
            reason: reason.into(),
        })
    }

    /// Create a custom point-to-point message.
    pub fn custom(target: impl Into<String>, payload: impl Into<String>) -> Self {
        Message::Custom {
            target: target.into(),
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Sync(_) => MessageKind::Sync,
            Message::Awareness(_) => MessageKind::Awareness,
            Message::Auth(_) => MessageKind::Auth,
            Message::QueryAwareness => MessageKind::QueryAwareness,
            Message::Custom { .. } => MessageKind::Custom,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    pub fn encode_to<W: Write>(&self, writer: &mut W) {
        writer.write_var(self.kind().tag());
        match self {
            Message::Sync(frame) => {
                writer.write_var(frame.step().tag());
                writer.write_buf(frame.payload());
            }
            Message::Awareness(update) => writer.write_buf(update),
            Message::Auth(AuthFrame::PermissionDenied { reason }) => {
                writer.write_var(AUTH_PERMISSION_DENIED);
                writer.write_string(reason);
            }
            Message::QueryAwareness => {}
            Message::Custom { target, payload } => {
                writer.write_string(target);
                writer.write_string(payload);
            }
        }
    }

    /// Deserialize from binary wire format.
    ///
    /// Empty or truncated input yields [`SyncError::MalformedMessage`];
    /// an unrecognised tag yields [`SyncError::UnknownMessageKind`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Self::decode_from(&mut cursor)
    }

    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        let tag: u64 = reader.read_var()?;
        let kind = MessageKind::from_tag(tag).ok_or(SyncError::UnknownMessageKind(tag))?;
        match kind {
            MessageKind::Sync => {
                let step: u64 = reader.read_var()?;
                let data = reader.read_buf()?.to_vec();
                match step {
                    0 => Ok(Message::Sync(SyncFrame::Step1(data))),
                    1 => Ok(Message::Sync(SyncFrame::Step2(data))),
                    2 => Ok(Message::Sync(SyncFrame::Update(data))),
                    other => Err(SyncError::MalformedMessage(format!(
                        "unknown sync step {other}"
                    ))),
                }
            }
            MessageKind::Awareness => Ok(Message::Awareness(reader.read_buf()?.to_vec())),
            MessageKind::Auth => {
                let reason_kind: u64 = reader.read_var()?;
                if reason_kind != AUTH_PERMISSION_DENIED {
                    return Err(SyncError::MalformedMessage(format!(
                        "unknown auth frame {reason_kind}"
                    )));
                }
                let reason = reader.read_string()?.to_string();
                Ok(Message::Auth(AuthFrame::PermissionDenied { reason }))
            }
            MessageKind::QueryAwareness => Ok(Message::QueryAwareness),
            MessageKind::Custom => {
                let target = reader.read_string()?.to_string();
                let payload = reader.read_string()?.to_string();
                Ok(Message::Custom { target, payload })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_frames_roundtrip() {
        for msg in [
            Message::sync_step1(vec![1, 0]),
            Message::sync_step2(vec![1, 2, 3, 4, 5]),
            Message::update(vec![9; 300]),
        ] {
            let decoded = Message::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_awareness_roundtrip() {
        let msg = Message::awareness(vec![1, 42, 3, 4, b'n', b'u', b'l', b'l']);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), MessageKind::Awareness);
    }

    #[test]
    fn test_auth_roundtrip() {
        let msg = Message::permission_denied("room is private");
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_query_awareness_is_tag_only() {
        let encoded = Message::QueryAwareness.encode();
        assert_eq!(encoded, vec![3]);
        assert_eq!(Message::decode(&encoded).unwrap(), Message::QueryAwareness);
    }

    #[test]
    fn test_custom_roundtrip() {
        let msg = Message::custom("peer-7", "hello");
        let encoded = msg.encode();
        assert_eq!(encoded[0], 4);
        match Message::decode(&encoded).unwrap() {
            Message::Custom { target, payload } => {
                assert_eq!(target, "peer-7");
                assert_eq!(payload, "hello");
            }
            other => panic!("expected custom message, got {other:?}"),
        }
    }

    #[test]
    fn test_wire_layout_matches_lib0() {
        // tag 0, step 2 (update), length 3, payload
        assert_eq!(Message::update(vec![7, 8, 9]).encode(), vec![0, 2, 3, 7, 8, 9]);
        // tag 1, length 2, payload
        assert_eq!(Message::awareness(vec![5, 6]).encode(), vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_decode_empty_is_malformed() {
        assert!(matches!(
            Message::decode(&[]),
            Err(SyncError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_truncated_is_malformed() {
        let mut encoded = Message::sync_step2(vec![1, 2, 3, 4]).encode();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            Message::decode(&encoded),
            Err(SyncError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        assert!(matches!(
            Message::decode(&[42, 1, 2]),
            Err(SyncError::UnknownMessageKind(42))
        ));
    }

    #[test]
    fn test_message_kind_tags_stable() {
        assert_eq!(MessageKind::Sync.tag(), 0);
        assert_eq!(MessageKind::Awareness.tag(), 1);
        assert_eq!(MessageKind::Auth.tag(), 2);
        assert_eq!(MessageKind::QueryAwareness.tag(), 3);
        assert_eq!(MessageKind::Custom.tag(), 4);
        assert_eq!(MessageKind::from_tag(5), None);
    }
}

//! Wire types and the binary WebSocket protocol.
//!
//! The request/response bodies here are shared by the HTTP handlers, the SSE
//! streams and the client transports, and serialize as camelCase JSON. The
//! WebSocket surface wraps them in [`ClientMessage`] / [`ServerMessage`] and
//! frames them with a small header followed by a bincode payload:
//!
//! ```text
//! +---------+------+-----------------+-----------------+
//! | version | type | length (u24 BE) | bincode payload |
//! +---------+------+-----------------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::presence::{Participant, ParticipantPatch};
use super::session::Session;
use super::{ClientId, ParticipantId, SyncError};
use crate::language::Language;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB, the u24 length limit)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Whole-document write submitted against a known base version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    pub code: String,
    /// Base version the edit was made against
    pub version: u64,
    pub client_id: ClientId,
}

/// Successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditAccepted {
    pub version: u64,
}

/// Authoritative snapshot returned when a write is rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub version: u64,
    pub code: String,
}

/// Language switch request.
///
/// `language` stays a string so unknown values can be reported as
/// [`SyncError::UnsupportedLanguage`] instead of a generic parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageRequest {
    pub language: String,
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

/// Result of a language switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageChanged {
    pub code: String,
    pub version: u64,
}

/// One entry of the document stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    pub code: String,
    pub language: Language,
    pub version: u64,
    /// Client whose write produced this version, if any
    pub source_client_id: Option<ClientId>,
}

impl From<&Session> for DocumentChange {
    fn from(session: &Session) -> Self {
        Self {
            code: session.code.clone(),
            language: session.language,
            version: session.version,
            source_client_id: session.last_client_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
}

/// Listing entry for `GET /v1/sessions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub language: Language,
    pub version: u64,
    pub participants: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Message type identifiers carried in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Welcome = 0x02,
    Error = 0x04,

    // Document
    SubmitEdit = 0x10,
    EditAccepted = 0x11,
    EditConflict = 0x12,
    DocumentChanged = 0x13,
    ChangeLanguage = 0x14,
    LanguageChanged = 0x15,

    // Membership
    Join = 0x20,
    Joined = 0x21,
    Leave = 0x22,
    Left = 0x23,

    // Presence
    PatchParticipant = 0x40,
    ParticipantUpdated = 0x41,
    Participants = 0x42,

    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x02 => Ok(MessageType::Welcome),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::SubmitEdit),
            0x11 => Ok(MessageType::EditAccepted),
            0x12 => Ok(MessageType::EditConflict),
            0x13 => Ok(MessageType::DocumentChanged),
            0x14 => Ok(MessageType::ChangeLanguage),
            0x15 => Ok(MessageType::LanguageChanged),
            0x20 => Ok(MessageType::Join),
            0x21 => Ok(MessageType::Joined),
            0x22 => Ok(MessageType::Leave),
            0x23 => Ok(MessageType::Left),
            0x40 => Ok(MessageType::PatchParticipant),
            0x41 => Ok(MessageType::ParticipantUpdated),
            0x42 => Ok(MessageType::Participants),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages sent from client to server over the WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    SubmitEdit(EditRequest),
    ChangeLanguage(LanguageRequest),
    Join(JoinRequest),
    PatchParticipant {
        participant_id: ParticipantId,
        patch: ParticipantPatch,
    },
    Leave {
        participant_id: ParticipantId,
    },
    /// Keepalive
    Ping {
        timestamp: u64,
    },
}

/// Messages sent from server to client over the WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First frame on every socket: full state to build on
    Welcome {
        protocol_version: u8,
        session: Session,
        participants: Vec<Participant>,
        server_time: i64,
    },

    Error {
        code: ErrorCode,
        message: String,
    },

    /// Document stream push
    DocumentChanged(DocumentChange),

    /// Presence stream push (full snapshot)
    Participants(Vec<Participant>),

    EditAccepted(EditAccepted),
    EditConflict(ConflictResponse),
    LanguageChanged(LanguageChanged),
    Joined(Participant),
    ParticipantUpdated(Participant),

    /// Reply to a leave; `removed` is false when the participant was already gone
    Left {
        participant_id: ParticipantId,
        removed: bool,
    },

    Pong {
        timestamp: u64,
        server_time: i64,
    },
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    SessionNotFound = 2,
    ParticipantNotFound = 3,
    UnsupportedLanguage = 4,
    DuplicateParticipant = 5,
    SessionFull = 6,
    ServerError = 7,
}

impl From<&SyncError> for ErrorCode {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            SyncError::ParticipantNotFound(_) => ErrorCode::ParticipantNotFound,
            SyncError::UnsupportedLanguage(_) => ErrorCode::UnsupportedLanguage,
            SyncError::DuplicateParticipant(_) => ErrorCode::DuplicateParticipant,
            SyncError::SessionFull(_) => ErrorCode::SessionFull,
            SyncError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            SyncError::Storage(_) | SyncError::Internal(_) => ErrorCode::ServerError,
        }
    }
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::SubmitEdit(_) => MessageType::SubmitEdit,
            ClientMessage::ChangeLanguage(_) => MessageType::ChangeLanguage,
            ClientMessage::Join(_) => MessageType::Join,
            ClientMessage::PatchParticipant { .. } => MessageType::PatchParticipant,
            ClientMessage::Leave { .. } => MessageType::Leave,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::DocumentChanged(_) => MessageType::DocumentChanged,
            ServerMessage::Participants(_) => MessageType::Participants,
            ServerMessage::EditAccepted(_) => MessageType::EditAccepted,
            ServerMessage::EditConflict(_) => MessageType::EditConflict,
            ServerMessage::LanguageChanged(_) => MessageType::LanguageChanged,
            ServerMessage::Joined(_) => MessageType::Joined,
            ServerMessage::ParticipantUpdated(_) => MessageType::ParticipantUpdated,
            ServerMessage::Left { .. } => MessageType::Left,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Decode a client message from a binary frame
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a server message from a binary frame
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a client message sent as a JSON text frame
    pub fn decode_client_text(text: &str) -> Result<ClientMessage, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response message
    pub fn error_response(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
    }

    fn check_type(header: MessageType, decoded: MessageType) -> Result<(), ProtocolError> {
        if header != decoded {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header type {:?} does not match payload {:?}",
                header, decoded
            )));
        }
        Ok(())
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::presence::CursorPosition;

    #[test]
    fn test_encode_decode_submit_edit() {
        let msg = ClientMessage::SubmitEdit(EditRequest {
            code: "print(1)".to_string(),
            version: 7,
            client_id: "client-123".to_string(),
        });

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::SubmitEdit as u8);

        let decoded = SyncProtocol::decode_client(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_join_frame_compares_equal() {
        let msg = ClientMessage::Join(JoinRequest {
            name: "Alice".to_string(),
        });

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[1], MessageType::Join as u8);
        assert_eq!(SyncProtocol::decode_client(&encoded).unwrap(), msg);
        assert_ne!(
            msg,
            ClientMessage::Join(JoinRequest {
                name: "Bob".to_string(),
            })
        );
    }

    #[test]
    fn test_encode_decode_welcome() {
        let session = Session::new("Interview", Language::Python);
        let msg = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            session: session.clone(),
            participants: Vec::new(),
            server_time: 1234567890,
        };

        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        match SyncProtocol::decode_server(&encoded).unwrap() {
            ServerMessage::Welcome {
                session: decoded, ..
            } => assert_eq!(decoded, session),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_patch_with_partial_fields() {
        let msg = ClientMessage::PatchParticipant {
            participant_id: "p1".to_string(),
            patch: ParticipantPatch {
                cursor: Some(CursorPosition { line: 3, column: 10 }),
                is_typing: None,
                is_online: Some(false),
            },
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(SyncProtocol::decode_client(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_decode_json_text_frame() {
        let text = r#"{"SubmitEdit":{"code":"B","version":0,"clientId":"c1"}}"#;
        let msg = SyncProtocol::decode_client_text(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubmitEdit(EditRequest {
                code: "B".to_string(),
                version: 0,
                client_id: "c1".to_string(),
            })
        );

        let text = r#"{"PatchParticipant":{"participant_id":"p1","patch":{"cursor":{"lineNumber":2,"column":4}}}}"#;
        match SyncProtocol::decode_client_text(text).unwrap() {
            ClientMessage::PatchParticipant { patch, .. } => {
                assert_eq!(patch.cursor, Some(CursorPosition { line: 2, column: 4 }));
                assert!(patch.is_typing.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = SyncProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_header_type_must_match_payload() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::Join as u8;

        let result = SyncProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
    }

    #[test]
    fn test_truncated_frame() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 9 }).unwrap();
        let result = SyncProtocol::decode_client(&data[..data.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(SyncProtocol::decode_client(&[1, 2]).is_err());
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x02).unwrap(), MessageType::Welcome);
        assert_eq!(MessageType::try_from(0x13).unwrap(), MessageType::DocumentChanged);
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_document_change_json_shape() {
        let change = DocumentChange {
            code: "x".to_string(),
            language: Language::Cpp,
            version: 4,
            source_client_id: None,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["language"], "cpp");
        assert_eq!(json["version"], 4);
        assert!(json["sourceClientId"].is_null());
    }

    #[test]
    fn test_language_request_client_id_optional() {
        let req: LanguageRequest = serde_json::from_str(r#"{"language":"python"}"#).unwrap();
        assert_eq!(req.language, "python");
        assert!(req.client_id.is_none());
    }

    #[test]
    fn test_error_code_mapping() {
        let err = SyncError::SessionFull("s".to_string());
        assert_eq!(ErrorCode::from(&err), ErrorCode::SessionFull);
        let err = SyncError::Internal("boom".to_string());
        assert_eq!(ErrorCode::from(&err), ErrorCode::ServerError);
    }
}

//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization. One message per line.
//!
//! Inbound messages never carry a trusted sender: any `sender` field on
//! the wire is ignored, and the session stamps its own identity.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Client → Server message
///
/// Every intent the relay understands. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create an account
    Register { username: String, secret: String },
    /// Authenticate this session
    Login { username: String, secret: String },
    /// Drop the identity, keep the connection
    Logout,
    /// Ask which identity this session carries
    WhoAmI,
    /// List online users
    ListUsers,
    /// Show the command reference
    Help,
    /// Chat text; defaults to the general room, or a direct message when
    /// `recipient` is set
    Text {
        content: String,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
    },
    /// Join an existing room
    JoinRoom { room: String },
    /// Leave a room
    LeaveRoom { room: String },
    /// Create a new room
    CreateRoom { room: String },
    /// Delete an empty room
    DeleteRoom { room: String },
    /// List all rooms
    ListRooms,
    /// One-to-one message
    Direct { recipient: String, content: String },
    /// Announce a file upload
    FileTransferRequest {
        recipient: String,
        filename: String,
        size: u64,
    },
    /// One offset-addressed slice of a file
    FileTransferChunk {
        recipient: String,
        filename: String,
        #[serde(deserialize_with = "base64_bytes::deserialize")]
        data: Vec<u8>,
        offset: u64,
        size: u64,
        #[serde(rename = "final", default)]
        last: bool,
    },
    /// List this user's transfers
    ListTransfers,
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room broadcast
    Text {
        sender: String,
        room: String,
        content: String,
    },
    /// One-to-one message
    Direct {
        sender: String,
        recipient: String,
        content: String,
    },
    /// Human-readable status from the relay itself
    Notice { content: String },
    /// Room listing
    RoomList { rooms: Vec<RoomEntry> },
    /// Online users
    UserList { users: Vec<UserEntry> },
    /// Upload progress for the sender
    FileProgress { filename: String, percent: u8 },
    /// Transfers involving the caller
    TransferList { transfers: Vec<TransferSummary> },
    /// Keep-alive
    Ping,
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    /// Shorthand for a relay notice
    pub fn notice(content: impl Into<String>) -> Self {
        ServerMessage::Notice {
            content: content.into(),
        }
    }
}

/// One row of a room listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomEntry {
    pub name: String,
    pub joined: bool,
}

/// One row of a user listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEntry {
    pub username: String,
    #[serde(rename = "self")]
    pub is_self: bool,
}

/// Snapshot of one transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    pub sender: String,
    pub recipient: String,
    pub filename: String,
    pub size: u64,
    pub bytes_written: u64,
    pub percent: u8,
    pub complete: bool,
}

/// Error codes for ServerMessage::Error
///
/// Represents different error scenarios that can be communicated to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    LoginRequired,
    AlreadyLoggedIn,
    UsernameTaken,
    InvalidCredentials,
    RoomNotFound,
    RoomExists,
    RoomNotEmpty,
    RoomProtected,
    NotInRoom,
    AlreadyInRoom,
    UserNotOnline,
    TransferNotFound,
    StorageFailed,
    Busy,
    Internal,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let code = match &err {
            AppError::Invalid(_) | AppError::Json(_) => ErrorCode::InvalidMessage,
            AppError::LoginRequired => ErrorCode::LoginRequired,
            AppError::AlreadyAuthenticated(_) | AppError::AlreadyLoggedIn(_) => {
                ErrorCode::AlreadyLoggedIn
            }
            AppError::UsernameTaken(_) => ErrorCode::UsernameTaken,
            AppError::InvalidCredentials => ErrorCode::InvalidCredentials,
            AppError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            AppError::RoomExists(_) => ErrorCode::RoomExists,
            AppError::RoomNotEmpty(_) => ErrorCode::RoomNotEmpty,
            AppError::RoomProtected(_) => ErrorCode::RoomProtected,
            AppError::NotInRoom(_) => ErrorCode::NotInRoom,
            AppError::AlreadyInRoom(_) => ErrorCode::AlreadyInRoom,
            AppError::UserNotOnline(_) => ErrorCode::UserNotOnline,
            AppError::TransferNotFound { .. } => ErrorCode::TransferNotFound,
            AppError::Storage(_) => ErrorCode::StorageFailed,
            AppError::RoomBusy(_) | AppError::ServerBusy => ErrorCode::Busy,
            _ => ErrorCode::Internal,
        };
        // Fatal and internal faults are not shown verbatim
        let message = if code == ErrorCode::Internal {
            "Internal error".to_string()
        } else {
            err.to_string()
        };
        ServerMessage::Error { code, message }
    }
}

/// Chunk payloads travel as standard base64 text
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

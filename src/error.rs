//! Error types for the chat relay
//!
//! Defines application-level errors and their classification.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (reported to the originating session only).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line framing error (fatal)
    #[error("Line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Bad or missing arguments
    #[error("{0}")]
    Invalid(String),

    /// Operation requires an authenticated session
    #[error("You must login first. Use /login <username> <password> or register with /register <username> <password>")]
    LoginRequired,

    /// This session is already authenticated
    #[error("You are already logged in as {0}")]
    AlreadyAuthenticated(String),

    /// The identity is bound to another live session
    #[error("User '{0}' is already logged in elsewhere")]
    AlreadyLoggedIn(String),

    /// Registration of an existing username
    #[error("Username '{0}' already exists")]
    UsernameTaken(String),

    /// Unknown username or wrong secret
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Room name not present in the directory
    #[error("Room {0} does not exist")]
    RoomNotFound(String),

    /// Room name already present in the directory
    #[error("Room {0} already exists")]
    RoomExists(String),

    /// Room still has members
    #[error("Cannot delete room {0}: room is not empty")]
    RoomNotEmpty(String),

    /// Room can never be deleted
    #[error("Cannot delete the {0} room")]
    RoomProtected(String),

    /// Session is not a member of the room
    #[error("You are not in room {0}. Join it first with /join {0}")]
    NotInRoom(String),

    /// Session is already a member of the room
    #[error("You are already in room: {0}")]
    AlreadyInRoom(String),

    /// Direct target has no live session
    #[error("User {0} is not online.")]
    UserNotOnline(String),

    /// No transfer tracked for the pair
    #[error("No transfer of {filename} from {sender}")]
    TransferNotFound { sender: String, filename: String },

    /// Received-file storage failure; the connection stays up
    #[error("Could not store file: {0}")]
    Storage(#[source] std::io::Error),

    /// A room's request queue is full
    #[error("Room {0} is busy, try again")]
    RoomBusy(String),

    /// The dispatch hub's request queue is full
    #[error("Server is busy, try again")]
    ServerBusy,

    /// Hashing backend failure
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// A blocking worker panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Error classification
///
/// Validation, not-found and conflict errors are recovered locally and
/// reported to the originating session. Transport errors end the
/// connection they happened on and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    /// A bounded queue refused the request
    Capacity,
    Transport,
    Internal,
}

impl AppError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Invalid(_) | AppError::LoginRequired | AppError::InvalidCredentials => {
                ErrorKind::Validation
            }
            AppError::RoomNotFound(_)
            | AppError::NotInRoom(_)
            | AppError::UserNotOnline(_)
            | AppError::TransferNotFound { .. } => ErrorKind::NotFound,
            AppError::AlreadyAuthenticated(_)
            | AppError::AlreadyLoggedIn(_)
            | AppError::UsernameTaken(_)
            | AppError::RoomExists(_)
            | AppError::RoomNotEmpty(_)
            | AppError::RoomProtected(_)
            | AppError::AlreadyInRoom(_) => ErrorKind::Conflict,
            AppError::RoomBusy(_) | AppError::ServerBusy => ErrorKind::Capacity,
            AppError::Io(_) | AppError::Codec(_) | AppError::ChannelSend => ErrorKind::Transport,
            AppError::Json(_)
            | AppError::Storage(_)
            | AppError::Credentials(_)
            | AppError::Task(_) => ErrorKind::Internal,
        }
    }
}

//! Basic type definitions for the chat relay
//!
//! Provides the session identifier newtype and the name rules shared by
//! usernames and room names.

use uuid::Uuid;

use crate::error::AppError;

/// Name of the room every authenticated session joins and nobody can delete
pub const GENERAL_ROOM: &str = "general";

/// Sender name used on notices synthesized by the relay itself
pub const SERVER_SENDER: &str = "Server";

/// Unique session identifier (newtype pattern)
///
/// Wraps a UUID v4. Assigned per connection, independent of the
/// username, so a session can be tracked before it authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check a username: 3-32 characters of `[A-Za-z0-9_-]`
///
/// Usernames double as directory names at the storage boundary, so the
/// character set is kept path-safe.
pub fn validate_username(username: &str) -> Result<(), AppError> {
    if username.len() < 3 {
        return Err(AppError::Invalid(
            "Username must be at least 3 characters long".to_string(),
        ));
    }
    if username.len() > 32 {
        return Err(AppError::Invalid(
            "Username must be at most 32 characters long".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Invalid(
            "Username may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// Check a room name: non-empty, no whitespace (case is preserved)
pub fn validate_room_name(room: &str) -> Result<(), AppError> {
    if room.is_empty() {
        return Err(AppError::Invalid("Room name must not be empty".to_string()));
    }
    if room.chars().any(char::is_whitespace) {
        return Err(AppError::Invalid(
            "Room name must not contain whitespace".to_string(),
        ));
    }
    Ok(())
}

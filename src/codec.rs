//! Line decoding and encoding
//!
//! Each line is one message. JSON lines decode to `ClientMessage`,
//! `/`-prefixed lines are commands, and anything else is chat text.
//! Unparsable input is never a protocol error.

use crate::command;
use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};

/// Decode one inbound line
///
/// Errors are validation failures (bad command arguments) to report
/// back to the session; the connection stays up.
pub fn decode_line(line: &str) -> Result<ClientMessage, AppError> {
    let raw = line.trim_end_matches(['\r', '\n']);
    let trimmed = raw.trim();

    if command::is_command(trimmed) {
        return command::parse(trimmed);
    }

    match serde_json::from_str::<ClientMessage>(trimmed) {
        Ok(ClientMessage::Text { content, .. }) if command::is_command(&content) => {
            command::parse(&content)
        }
        Ok(ClientMessage::Text {
            content,
            recipient: Some(recipient),
            ..
        }) => Ok(ClientMessage::Direct { recipient, content }),
        Ok(msg) => Ok(msg),
        Err(_) => Ok(ClientMessage::Text {
            content: raw.to_string(),
            room: None,
            recipient: None,
        }),
    }
}

/// Encode one outbound message (without the line terminator)
pub fn encode(msg: &ServerMessage) -> Result<String, AppError> {
    Ok(serde_json::to_string(msg)?)
}

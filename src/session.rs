//! Session struct definition
//!
//! Represents one connected participant: identity, room memberships and
//! the bounded outbound mailbox drained by the connection's writer task.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::message::ServerMessage;
use crate::types::SessionId;

/// Outcome of a mailbox enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Mailbox full or writer gone; the message was discarded
    Dropped,
}

#[derive(Debug, Default)]
struct SessionState {
    username: Option<String>,
    rooms: BTreeSet<String>,
}

/// Connected session
///
/// Shared by `Arc` between the connection handler, the hub and every
/// room actor the session belongs to. The room set is only mutated by
/// the room actor that owns the corresponding membership.
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this session
    id: SessionId,
    /// Identity and membership
    state: Mutex<SessionState>,
    /// Server → Client mailbox
    mailbox: mpsc::Sender<ServerMessage>,
}

impl Session {
    /// Create a new session with the given ID and mailbox sender
    pub fn new(id: SessionId, mailbox: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::default()),
            mailbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a message without waiting
    ///
    /// A full mailbox means the writer is not keeping up; the message is
    /// discarded and `Dropped` reported so the caller can react.
    pub fn enqueue(&self, msg: ServerMessage) -> Delivery {
        match self.mailbox.try_send(msg) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                debug!("Mailbox full for session {}", self.id);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Mailbox closed for session {}", self.id);
                Delivery::Dropped
            }
        }
    }

    /// Authenticated username, if any
    pub fn username(&self) -> Option<String> {
        self.state().username.clone()
    }

    /// Get the display name for this session
    ///
    /// Returns the username if set, otherwise "Unknown".
    pub fn display_name(&self) -> String {
        self.username().unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().username.is_some()
    }

    pub(crate) fn set_username(&self, username: String) {
        self.state().username = Some(username);
    }

    pub(crate) fn clear_username(&self) -> Option<String> {
        self.state().username.take()
    }

    /// Rooms this session currently belongs to, sorted
    pub fn rooms(&self) -> Vec<String> {
        self.state().rooms.iter().cloned().collect()
    }

    pub fn is_in_room(&self, room: &str) -> bool {
        self.state().rooms.contains(room)
    }

    pub(crate) fn add_room(&self, room: &str) {
        self.state().rooms.insert(room.to_string());
    }

    pub(crate) fn remove_room(&self, room: &str) {
        self.state().rooms.remove(room);
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

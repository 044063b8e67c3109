//! Dispatch hub actor implementation
//!
//! The single coordination point for operations that are not local to
//! one room: binding identities to sessions, routing broadcasts to room
//! actors, resolving direct-message targets and announcing transfers.
//! Uses the Actor pattern with mpsc channels for message passing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::directory::RoomDirectory;
use crate::error::{AppError, ErrorKind};
use crate::message::{RoomEntry, ServerMessage, UserEntry};
use crate::room::Registration;
use crate::session::{Delivery, Session};
use crate::transfer::{Begin, Reassembler};
use crate::types::GENERAL_ROOM;

/// Commands sent from connection handlers to the hub
#[derive(Debug)]
pub enum HubCommand {
    /// Bind a verified identity to a session
    Login {
        session: Arc<Session>,
        username: String,
        reply: oneshot::Sender<Result<(), ErrorKind>>,
    },
    /// Release the identity, keep the connection
    Logout { session: Arc<Session> },
    /// Connection closed; `done` fires once every membership is released
    Disconnect {
        session: Arc<Session>,
        done: oneshot::Sender<()>,
    },
    JoinRoom {
        session: Arc<Session>,
        room: String,
    },
    LeaveRoom {
        session: Arc<Session>,
        room: String,
    },
    CreateRoom {
        session: Arc<Session>,
        room: String,
    },
    DeleteRoom {
        session: Arc<Session>,
        room: String,
    },
    ListRooms {
        session: Arc<Session>,
    },
    /// Room message; `None` targets the general room
    Broadcast {
        session: Arc<Session>,
        room: Option<String>,
        content: String,
    },
    Direct {
        session: Arc<Session>,
        recipient: String,
        content: String,
    },
    ListUsers {
        session: Arc<Session>,
    },
    /// Announce an upload to `recipient`
    OfferFile {
        session: Arc<Session>,
        recipient: String,
        filename: String,
        size: u64,
    },
    /// Best-effort delivery to an identity, if online
    Deliver {
        recipient: String,
        message: ServerMessage,
    },
}

/// The dispatch hub actor
///
/// Owns the identity → session directory. Room membership lives in
/// the room actors; the hub only forwards to them.
pub struct Hub {
    /// Authenticated sessions: username -> Session
    online: HashMap<String, Arc<Session>>,
    directory: Arc<RoomDirectory>,
    transfers: Arc<Reassembler>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a hub with the given command receiver
    pub fn new(
        receiver: mpsc::Receiver<HubCommand>,
        directory: Arc<RoomDirectory>,
        transfers: Arc<Reassembler>,
    ) -> Self {
        Self {
            online: HashMap::new(),
            directory,
            transfers,
            receiver,
        }
    }

    /// Run the hub event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("Dispatch hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("Dispatch hub shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Login {
                session,
                username,
                reply,
            } => {
                let result = self.handle_login(&session, username).await;
                let outcome = result.as_ref().map(|_| ()).map_err(AppError::kind);
                report(&session, result);
                let _ = reply.send(outcome);
            }
            HubCommand::Logout { session } => {
                let result = self.handle_logout(&session).await;
                report(&session, result);
            }
            HubCommand::Disconnect { session, done } => {
                self.handle_disconnect(&session).await;
                let _ = done.send(());
            }
            HubCommand::JoinRoom { session, room } => {
                let result = self.handle_join_room(&session, room).await;
                report(&session, result);
            }
            HubCommand::LeaveRoom { session, room } => {
                let result = self.handle_leave_room(&session, room).await;
                report(&session, result);
            }
            HubCommand::CreateRoom { session, room } => {
                let result = self.handle_create_room(&session, room);
                report(&session, result);
            }
            HubCommand::DeleteRoom { session, room } => {
                let result = self.handle_delete_room(&session, room);
                report(&session, result);
            }
            HubCommand::ListRooms { session } => {
                let result = self.handle_list_rooms(&session);
                report(&session, result);
            }
            HubCommand::Broadcast {
                session,
                room,
                content,
            } => {
                let result = self.handle_broadcast(&session, room, content);
                report(&session, result);
            }
            HubCommand::Direct {
                session,
                recipient,
                content,
            } => {
                let result = self.handle_direct(&session, recipient, content);
                report(&session, result);
            }
            HubCommand::ListUsers { session } => {
                let result = self.handle_list_users(&session);
                report(&session, result);
            }
            HubCommand::OfferFile {
                session,
                recipient,
                filename,
                size,
            } => {
                let result = self.handle_offer_file(&session, recipient, filename, size);
                report(&session, result);
            }
            HubCommand::Deliver { recipient, message } => {
                self.handle_deliver(&recipient, message);
            }
        }
    }

    /// Handle identity binding after the credentials were verified
    async fn handle_login(&mut self, session: &Arc<Session>, username: String) -> Result<(), AppError> {
        if let Some(current) = session.username() {
            return Err(AppError::AlreadyAuthenticated(current));
        }
        if self.online.contains_key(&username) {
            return Err(AppError::AlreadyLoggedIn(username));
        }

        session.set_username(username.clone());
        self.online.insert(username.clone(), session.clone());
        info!("Session {} logged in as '{}'", session.id(), username);

        self.directory
            .get(GENERAL_ROOM)?
            .register(session.clone())
            .await?;

        session.enqueue(ServerMessage::notice(format!(
            "Welcome to the chat server, {}! You've been added to the '{}' room.",
            username, GENERAL_ROOM
        )));
        debug!("Online users: {}", self.online.len());
        Ok(())
    }

    async fn handle_logout(&mut self, session: &Arc<Session>) -> Result<(), AppError> {
        let Some(username) = session.username() else {
            return Err(AppError::Invalid("You are not logged in".to_string()));
        };

        self.release(session).await;
        session.clear_username();
        info!("Session {} logged out from '{}'", session.id(), username);

        session.enqueue(ServerMessage::notice(format!(
            "You have been logged out from account: {}",
            username
        )));
        Ok(())
    }

    /// Handle connection loss
    async fn handle_disconnect(&mut self, session: &Arc<Session>) {
        self.release(session).await;
        info!("Session {} disconnected", session.id());
        debug!("Online users: {}", self.online.len());
    }

    /// Leave every room, free the identity and drop outgoing transfers
    async fn release(&mut self, session: &Arc<Session>) {
        for room in session.rooms() {
            let Ok(handle) = self.directory.get(&room) else {
                continue;
            };
            if let Err(e) = handle.unregister(session.clone()).await {
                debug!("Unregister from {} failed: {}", room, e);
            }
        }

        if let Some(username) = session.username() {
            let bound_here = self
                .online
                .get(&username)
                .is_some_and(|s| s.id() == session.id());
            // A newer session owns the name and its transfers
            if bound_here {
                self.online.remove(&username);
                self.transfers.release(&username);
            }
        }
    }

    async fn handle_join_room(&mut self, session: &Arc<Session>, room: String) -> Result<(), AppError> {
        identity(session)?;
        if session.is_in_room(&room) {
            return Err(AppError::AlreadyInRoom(room));
        }

        let handle = self.directory.get(&room)?;
        match handle.register(session.clone()).await? {
            Registration::Joined => {
                session.enqueue(ServerMessage::notice(format!("You have joined room: {}", room)));
                Ok(())
            }
            Registration::AlreadyMember => Err(AppError::AlreadyInRoom(room)),
        }
    }

    async fn handle_leave_room(&mut self, session: &Arc<Session>, room: String) -> Result<(), AppError> {
        identity(session)?;
        if !session.is_in_room(&room) {
            return Err(AppError::NotInRoom(room));
        }

        let handle = self.directory.get(&room)?;
        handle.unregister(session.clone()).await?;
        session.enqueue(ServerMessage::notice(format!("You have left room: {}", room)));
        Ok(())
    }

    fn handle_create_room(&mut self, session: &Arc<Session>, room: String) -> Result<(), AppError> {
        identity(session)?;
        self.directory.create(&room)?;
        session.enqueue(ServerMessage::notice(format!("Room created: {}", room)));
        Ok(())
    }

    fn handle_delete_room(&mut self, session: &Arc<Session>, room: String) -> Result<(), AppError> {
        identity(session)?;
        self.directory.delete(&room)?;
        session.enqueue(ServerMessage::notice(format!("Room deleted: {}", room)));
        Ok(())
    }

    fn handle_list_rooms(&self, session: &Arc<Session>) -> Result<(), AppError> {
        identity(session)?;
        let rooms = self
            .directory
            .list()
            .into_iter()
            .map(|name| RoomEntry {
                joined: session.is_in_room(&name),
                name,
            })
            .collect();
        session.enqueue(ServerMessage::RoomList { rooms });
        Ok(())
    }

    /// Handle room message
    fn handle_broadcast(
        &mut self,
        session: &Arc<Session>,
        room: Option<String>,
        content: String,
    ) -> Result<(), AppError> {
        let sender = identity(session)?;
        let room = room.unwrap_or_else(|| GENERAL_ROOM.to_string());

        let handle = self.directory.get(&room)?;
        if !session.is_in_room(&room) {
            return Err(AppError::NotInRoom(room));
        }

        debug!("Broadcast from {} to {}", sender, room);
        handle
            .broadcast(ServerMessage::Text {
                sender,
                room,
                content,
            })
    }

    /// Handle one-to-one message
    fn handle_direct(&mut self, session: &Arc<Session>, recipient: String, content: String) -> Result<(), AppError> {
        let sender = identity(session)?;
        let Some(target) = self.online.get(&recipient) else {
            return Err(AppError::UserNotOnline(recipient));
        };

        let delivery = target.enqueue(ServerMessage::Direct {
            sender,
            recipient: recipient.clone(),
            content: content.clone(),
        });
        if delivery == Delivery::Dropped {
            debug!("Direct message to {} dropped", recipient);
        }

        session.enqueue(ServerMessage::notice(format!("(To {}): {}", recipient, content)));
        Ok(())
    }

    fn handle_list_users(&self, session: &Arc<Session>) -> Result<(), AppError> {
        let me = identity(session)?;
        let mut users: Vec<UserEntry> = self
            .online
            .keys()
            .map(|name| UserEntry {
                is_self: *name == me,
                username: name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        session.enqueue(ServerMessage::UserList { users });
        Ok(())
    }

    fn handle_offer_file(
        &mut self,
        session: &Arc<Session>,
        recipient: String,
        filename: String,
        size: u64,
    ) -> Result<(), AppError> {
        let sender = identity(session)?;
        let Some(target) = self.online.get(&recipient) else {
            return Err(AppError::UserNotOnline(recipient));
        };

        let status = match self.transfers.begin(&sender, &recipient, &filename, size)? {
            Begin::Started => format!(
                "Sending {} ({} bytes) to {}",
                filename, size, recipient
            ),
            Begin::Superseded => format!(
                "Restarted transfer of {} to {}; the previous upload was discarded",
                filename, recipient
            ),
        };

        target.enqueue(ServerMessage::notice(format!(
            "Incoming file {} ({} bytes) from {}",
            filename, size, sender
        )));
        session.enqueue(ServerMessage::notice(status));
        Ok(())
    }

    fn handle_deliver(&self, recipient: &str, message: ServerMessage) {
        match self.online.get(recipient) {
            Some(target) => {
                target.enqueue(message);
            }
            None => debug!("Dropping delivery for offline user {}", recipient),
        }
    }
}

/// The session's username, or `LoginRequired`
fn identity(session: &Session) -> Result<String, AppError> {
    session.username().ok_or(AppError::LoginRequired)
}

/// Send a failed operation's error back to its originator
fn report(session: &Session, result: Result<(), AppError>) {
    if let Err(e) = result {
        debug!("Session {} request failed: {}", session.id(), e);
        session.enqueue(e.into());
    }
}

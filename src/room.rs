//! Room actor implementation
//!
//! Each room owns its membership set and processes registration,
//! unregistration and broadcast requests one at a time from a private
//! queue, so every operation on one room observes a total order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::message::ServerMessage;
use crate::session::{Delivery, Session};
use crate::types::{SessionId, SERVER_SENDER};

/// Requests processed by a room actor
#[derive(Debug)]
pub enum RoomCommand {
    /// Add a session to the room
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<Result<Registration, AppError>>,
    },
    /// Remove a session from the room
    Unregister {
        session: Arc<Session>,
        reply: oneshot::Sender<bool>,
    },
    /// Deliver a message to every member
    Broadcast { message: ServerMessage },
    /// Snapshot of the member ids
    Members {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Joined,
    AlreadyMember,
}

/// Membership count and deletion flag, checked together so a room can
/// never be deleted while a registration slips in.
#[derive(Debug, Default)]
struct Gate {
    members: usize,
    closed: bool,
}

/// Cloneable address of a running room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    name: Arc<str>,
    sender: mpsc::Sender<RoomCommand>,
    gate: Arc<Mutex<Gate>>,
}

impl RoomHandle {
    /// Start a room actor on the current runtime
    pub fn spawn(name: &str, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let gate = Arc::new(Mutex::new(Gate::default()));
        let name: Arc<str> = Arc::from(name);

        let room = Room {
            name: name.clone(),
            members: HashMap::new(),
            receiver,
            gate: gate.clone(),
        };
        tokio::spawn(room.run());

        Self { name, sender, gate }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `session`; idempotent
    ///
    /// Fails with `RoomNotFound` if the room was deleted before the
    /// request reached the actor, and with `RoomBusy` if its queue is full.
    pub async fn register(&self, session: Arc<Session>) -> Result<Registration, AppError> {
        let (reply, rx) = oneshot::channel();
        self.offer(RoomCommand::Register { session, reply })?;
        rx.await.map_err(|_| AppError::ChannelSend)?
    }

    /// Remove `session`; returns whether it was a member
    ///
    /// Waits for queue space: membership cleanup is never refused.
    pub async fn unregister(&self, session: Arc<Session>) -> Result<bool, AppError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Unregister { session, reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Queue a broadcast; delivery happens on the actor's turn
    pub fn broadcast(&self, message: ServerMessage) -> Result<(), AppError> {
        self.offer(RoomCommand::Broadcast { message })
    }

    /// Non-blocking enqueue onto the actor's queue
    fn offer(&self, cmd: RoomCommand) -> Result<(), AppError> {
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!("Room {} queue full, refusing request", self.name);
                AppError::RoomBusy(self.name.to_string())
            }
            TrySendError::Closed(_) => AppError::ChannelSend,
        })
    }

    /// Current member ids, observed in queue order
    pub async fn members(&self) -> Result<Vec<SessionId>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Members { reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Member count as of the last processed request
    pub fn member_count(&self) -> usize {
        lock(&self.gate).members
    }

    /// Mark the room deleted if it has no members
    ///
    /// Returns false, and leaves the room open, when members remain.
    pub(crate) fn close_if_empty(&self) -> bool {
        let mut gate = lock(&self.gate);
        if gate.members > 0 {
            return false;
        }
        gate.closed = true;
        true
    }
}

/// Room actor state
///
/// Owned by the actor task; never touched from outside except through
/// the queue and the gate.
#[derive(Debug)]
struct Room {
    name: Arc<str>,
    /// Members indexed by session
    members: HashMap<SessionId, Arc<Session>>,
    receiver: mpsc::Receiver<RoomCommand>,
    gate: Arc<Mutex<Gate>>,
}

impl Room {
    /// Run the room event loop until every handle is dropped
    async fn run(mut self) {
        debug!("Room {} actor started", self.name);

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!("Room {} actor stopped", self.name);
    }

    fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Register { session, reply } => {
                let _ = reply.send(self.register(session));
            }
            RoomCommand::Unregister { session, reply } => {
                let _ = reply.send(self.unregister(&session));
            }
            RoomCommand::Broadcast { message } => {
                self.fan_out(message, None);
            }
            RoomCommand::Members { reply } => {
                let _ = reply.send(self.members.keys().copied().collect());
            }
        }
    }

    fn register(&mut self, session: Arc<Session>) -> Result<Registration, AppError> {
        if self.members.contains_key(&session.id()) {
            return Ok(Registration::AlreadyMember);
        }

        {
            let mut gate = lock(&self.gate);
            if gate.closed {
                return Err(AppError::RoomNotFound(self.name.to_string()));
            }
            gate.members += 1;
        }

        let id = session.id();
        session.add_room(&self.name);
        let notice = self.notice(format!("{} has joined the room.", session.display_name()));
        self.members.insert(id, session);

        info!(
            "Session {} joined room {} ({} members)",
            id,
            self.name,
            self.members.len()
        );

        // The joiner gets a personal confirmation from the hub instead
        self.fan_out(notice, Some(id));
        Ok(Registration::Joined)
    }

    fn unregister(&mut self, session: &Session) -> bool {
        let Some(removed) = self.remove_member(session.id()) else {
            return false;
        };

        info!("Session {} left room {}", removed.id(), self.name);

        let notice = self.notice(format!("{} has left the room.", removed.display_name()));
        self.fan_out(notice, None);
        true
    }

    /// Deliver to every member except `exclude`, evicting members whose
    /// mailbox refuses the message. Each eviction announces the departure
    /// to the remaining members.
    fn fan_out(&mut self, message: ServerMessage, exclude: Option<SessionId>) {
        let mut pending = vec![(message, exclude)];

        while let Some((message, exclude)) = pending.pop() {
            let dropped: Vec<SessionId> = self
                .members
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .filter(|(_, session)| session.enqueue(message.clone()) == Delivery::Dropped)
                .map(|(id, _)| *id)
                .collect();

            for id in dropped {
                if let Some(session) = self.remove_member(id) {
                    warn!(
                        "Evicting unresponsive session {} from room {}",
                        id, self.name
                    );
                    let notice =
                        self.notice(format!("{} has left the room.", session.display_name()));
                    pending.push((notice, None));
                }
            }
        }
    }

    /// Drop one member from both sides of the membership relation
    fn remove_member(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.members.remove(&id)?;
        session.remove_room(&self.name);
        let mut gate = lock(&self.gate);
        gate.members = gate.members.saturating_sub(1);
        Some(session)
    }

    fn notice(&self, content: String) -> ServerMessage {
        ServerMessage::Text {
            sender: SERVER_SENDER.to_string(),
            room: self.name.to_string(),
            content,
        }
    }
}

fn lock(gate: &Mutex<Gate>) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

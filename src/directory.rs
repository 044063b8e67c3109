//! Room directory
//!
//! Owns the name → room actor mapping. Every check-then-act (create,
//! delete) runs inside one critical section on the map; the lock is
//! never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::error::AppError;
use crate::room::RoomHandle;
use crate::types::{validate_room_name, GENERAL_ROOM};

/// Name → room registry
#[derive(Debug)]
pub struct RoomDirectory {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    /// Queue depth for every room actor spawned here
    queue_capacity: usize,
}

impl RoomDirectory {
    /// Create a directory holding the permanent general room
    ///
    /// Must be called from within a tokio runtime (room actors are spawned).
    pub fn new(queue_capacity: usize) -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(
            GENERAL_ROOM.to_string(),
            RoomHandle::spawn(GENERAL_ROOM, queue_capacity),
        );
        Self {
            rooms: Mutex::new(rooms),
            queue_capacity,
        }
    }

    /// Create a room; fails without side effects if the name is taken
    pub fn create(&self, name: &str) -> Result<RoomHandle, AppError> {
        validate_room_name(name)?;

        let mut rooms = self.rooms();
        if rooms.contains_key(name) {
            return Err(AppError::RoomExists(name.to_string()));
        }
        let handle = RoomHandle::spawn(name, self.queue_capacity);
        rooms.insert(name.to_string(), handle.clone());
        drop(rooms);

        info!("Room {} created", name);
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Result<RoomHandle, AppError> {
        self.rooms()
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::RoomNotFound(name.to_string()))
    }

    /// Delete an empty room other than general
    pub fn delete(&self, name: &str) -> Result<(), AppError> {
        let mut rooms = self.rooms();
        let Some(room) = rooms.get(name) else {
            return Err(AppError::RoomNotFound(name.to_string()));
        };
        if name == GENERAL_ROOM {
            return Err(AppError::RoomProtected(name.to_string()));
        }
        if !room.close_if_empty() {
            return Err(AppError::RoomNotEmpty(name.to_string()));
        }
        rooms.remove(name);
        drop(rooms);

        info!("Room {} deleted", name);
        Ok(())
    }

    /// All room names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms().keys().cloned().collect();
        names.sort();
        names
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, RoomHandle>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

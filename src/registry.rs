use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::CoordinatorError;
use crate::room::Room;
use crate::types::{RoomId, SessionId};

/// A room and the lock that serializes every mutation of it.
pub type SharedRoom = Arc<Mutex<Room>>;

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<RoomId, SharedRoom>,
    by_session: HashMap<SessionId, RoomId>,
    ended_sessions: HashSet<SessionId>,
}

/// Active rooms, keyed by room id and by consultation session.
///
/// The outer lock is only held to look a room up or to insert/remove one; all room
/// state lives behind the room's own mutex, so unrelated rooms never wait on each other.
#[derive(Default)]
pub struct RoomRegistry {
    state: RwLock<RegistryState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, room_id: &str) -> Option<SharedRoom> {
        let state = self.state.read().await;
        state.rooms.get(room_id).cloned()
    }

    pub async fn get_by_session(&self, session_id: &str) -> Option<SharedRoom> {
        let state = self.state.read().await;
        state
            .by_session
            .get(session_id)
            .and_then(|room_id| state.rooms.get(room_id))
            .cloned()
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<Room> {
        let room = self.get(room_id).await?;
        let room = room.lock().await;
        Some(room.clone())
    }

    pub async fn is_session_ended(&self, session_id: &str) -> bool {
        self.state.read().await.ended_sessions.contains(session_id)
    }

    /// Returns the room for `session_id`, inserting the one built by `make` if there is none.
    /// The boolean is true when `make` was used.
    pub async fn get_or_insert<F>(
        &self,
        session_id: &str,
        make: F,
    ) -> Result<(SharedRoom, bool), CoordinatorError>
    where
        F: FnOnce() -> Room,
    {
        let mut state = self.state.write().await;
        if state.ended_sessions.contains(session_id) {
            return Err(CoordinatorError::SessionEnded(session_id.to_string()));
        }
        if let Some(room) = state
            .by_session
            .get(session_id)
            .and_then(|room_id| state.rooms.get(room_id))
        {
            return Ok((Arc::clone(room), false));
        }

        let room = make();
        let room_id = room.id.clone();
        let shared = Arc::new(Mutex::new(room));
        state.rooms.insert(room_id.clone(), Arc::clone(&shared));
        state.by_session.insert(session_id.to_string(), room_id);
        Ok((shared, true))
    }

    /// Forgets an ended room. With `tombstone` set the session can never get another room.
    pub async fn remove(&self, room_id: &str, session_id: &str, tombstone: bool) -> bool {
        let mut state = self.state.write().await;
        let removed = state.rooms.remove(room_id).is_some();
        if state.by_session.get(session_id).map(String::as_str) == Some(room_id) {
            state.by_session.remove(session_id);
        }
        if tombstone {
            state.ended_sessions.insert(session_id.to_string());
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rooms.is_empty()
    }
}

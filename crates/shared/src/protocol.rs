use serde::{Deserialize, Serialize};

use crate::domain::{Message, RoomId};

/// One push-feed delivery: every non-deleted message of a room, ordered by
/// creation. Consumers replace their view with it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub messages: Vec<Message>,
}

impl RoomSnapshot {
    pub fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FeedEvent {
    RoomChanged { snapshot: RoomSnapshot },
    RoomDeleted { room_id: RoomId },
}

impl FeedEvent {
    pub fn room_id(&self) -> RoomId {
        match self {
            FeedEvent::RoomChanged { snapshot } => snapshot.room_id,
            FeedEvent::RoomDeleted { room_id } => *room_id,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;

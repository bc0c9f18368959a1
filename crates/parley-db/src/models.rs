//! Database row types and unit-of-work outcomes. Populated views handed to
//! callers live in parley-types; these stay internal to the store's shape.
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::models::{ConversationView, MessageView};

pub struct ConversationRow {
    pub id: Uuid,
    pub latest_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message as submitted by its sender; the store stamps `created_at`
/// inside the sending transaction.
pub struct NewMessage<'a> {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: &'a str,
}

pub enum SendOutcome {
    /// Message and projection committed together.
    Sent {
        message: MessageView,
        conversation: ConversationView,
    },
    ConversationNotFound,
    NotParticipant,
    /// A message with this id already exists.
    DuplicateId,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UsernameOutcome {
    Updated,
    Taken,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public identity of a user. `username` stays empty until the user picks one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: Option<String>,
}

/// A conversation member together with their unread flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: Uuid,
    pub user: UserSummary,
    pub has_seen_latest_message: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: UserSummary,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation with its participants and latest message populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub latest_message_id: Option<Uuid>,
    pub latest_message: Option<MessageView>,
    pub participants: Vec<ParticipantView>,
}

impl ConversationView {
    pub fn participant(&self, user_id: Uuid) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| p.user.id == user_id)
    }

    /// Participants whose unread flag is clear.
    pub fn seen_by(&self) -> impl Iterator<Item = &ParticipantView> {
        self.participants.iter().filter(|p| p.has_seen_latest_message)
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationView, MessageView, ParticipantView};

/// Named channels on the event bus, one per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    ConversationCreated,
    ConversationUpdated,
    ConversationDeleted,
    MessageSent,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ConversationCreated => "CONVERSATION_CREATED",
            Topic::ConversationUpdated => "CONVERSATION_UPDATED",
            Topic::ConversationDeleted => "CONVERSATION_DELETED",
            Topic::MessageSent => "MESSAGE_SENT",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `ConversationCreated` and `ConversationUpdated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub conversation: ConversationView,
}

/// Snapshot taken before the rows were deleted; the participant list cannot
/// be queried afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDeletedPayload {
    pub id: Uuid,
    pub participants: Vec<ParticipantView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentPayload {
    pub conversation_id: Uuid,
    pub message: MessageView,
    /// Membership as committed together with the message.
    pub participants: Vec<ParticipantView>,
}

/// Domain events published on the bus after the corresponding write commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BusEvent {
    ConversationCreated(ConversationPayload),
    ConversationUpdated(ConversationPayload),
    ConversationDeleted(ConversationDeletedPayload),
    MessageSent(MessageSentPayload),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::ConversationCreated(_) => Topic::ConversationCreated,
            Self::ConversationUpdated(_) => Topic::ConversationUpdated,
            Self::ConversationDeleted(_) => Topic::ConversationDeleted,
            Self::MessageSent(_) => Topic::MessageSent,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::ConversationCreated(p) | Self::ConversationUpdated(p) => p.conversation.id,
            Self::ConversationDeleted(p) => p.id,
            Self::MessageSent(p) => p.conversation_id,
        }
    }
}

/// What a gateway client asks to be streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionRequest {
    ConversationCreated,
    ConversationUpdated,
    ConversationDeleted,
    MessageSent { conversation_id: Uuid },
}

impl SubscriptionRequest {
    pub fn topic(&self) -> Topic {
        match self {
            Self::ConversationCreated => Topic::ConversationCreated,
            Self::ConversationUpdated => Topic::ConversationUpdated,
            Self::ConversationDeleted => Topic::ConversationDeleted,
            Self::MessageSent { .. } => Topic::MessageSent,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection accepted; `user_id` is empty for anonymous connections.
    Ready { user_id: Option<Uuid> },

    /// An authorized bus event for one of the client's subscriptions
    Event { subscription_id: String, event: BusEvent },

    /// A subscribe request was refused
    SubscriptionError { id: String, reason: String },

    /// The subscription has ended and will deliver nothing more
    Complete { id: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start streaming a topic under a client-chosen id
    Subscribe {
        id: String,
        subscription: SubscriptionRequest,
    },

    /// Stop a previously started subscription
    Unsubscribe { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_command_wire_format() {
        let conversation_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"Subscribe","data":{{"id":"s1","subscription":{{"topic":"MESSAGE_SENT","conversation_id":"{}"}}}}}}"#,
            conversation_id
        );
        let cmd: GatewayCommand = serde_json::from_str(&raw).unwrap();
        match cmd {
            GatewayCommand::Subscribe { id, subscription } => {
                assert_eq!(id, "s1");
                assert_eq!(subscription, SubscriptionRequest::MessageSent { conversation_id });
                assert_eq!(subscription.topic(), Topic::MessageSent);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn unit_topic_subscribe_parses() {
        let raw = r#"{"type":"Subscribe","data":{"id":"c","subscription":{"topic":"CONVERSATION_DELETED"}}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            cmd,
            GatewayCommand::Subscribe { subscription: SubscriptionRequest::ConversationDeleted, .. }
        ));
    }

    #[test]
    fn topic_names() {
        assert_eq!(Topic::MessageSent.to_string(), "MESSAGE_SENT");
        assert_eq!(
            serde_json::to_string(&Topic::ConversationCreated).unwrap(),
            "\"CONVERSATION_CREATED\""
        );
    }

    #[test]
    fn deleted_event_exposes_snapshot() {
        let id = Uuid::new_v4();
        let event = BusEvent::ConversationDeleted(ConversationDeletedPayload {
            id,
            participants: vec![],
        });
        assert_eq!(event.topic(), Topic::ConversationDeleted);
        assert_eq!(event.conversation_id(), id);
    }
}

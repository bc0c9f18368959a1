//! Delivery predicates: may this requester see this event?
//!
//! Every rule is the same membership test against the participant snapshot
//! carried by the payload, so no store lookup happens per delivery. An
//! anonymous requester never passes.

use uuid::Uuid;

use parley_types::events::{
    BusEvent, ConversationDeletedPayload, ConversationPayload, MessageSentPayload,
    SubscriptionRequest,
};
use parley_types::models::ParticipantView;

pub fn is_participant(participants: &[ParticipantView], user_id: Uuid) -> bool {
    participants.iter().any(|p| p.user.id == user_id)
}

pub fn conversation_created(payload: &ConversationPayload, requester: Option<Uuid>) -> bool {
    requester.is_some_and(|id| payload.conversation.participant(id).is_some())
}

pub fn conversation_updated(payload: &ConversationPayload, requester: Option<Uuid>) -> bool {
    requester.is_some_and(|id| payload.conversation.participant(id).is_some())
}

pub fn conversation_deleted(payload: &ConversationDeletedPayload, requester: Option<Uuid>) -> bool {
    requester.is_some_and(|id| is_participant(&payload.participants, id))
}

pub fn message_sent(payload: &MessageSentPayload, requester: Option<Uuid>) -> bool {
    requester.is_some_and(|id| is_participant(&payload.participants, id))
}

/// Membership check for any bus event.
pub fn authorize(event: &BusEvent, requester: Option<Uuid>) -> bool {
    match event {
        BusEvent::ConversationCreated(p) => conversation_created(p, requester),
        BusEvent::ConversationUpdated(p) => conversation_updated(p, requester),
        BusEvent::ConversationDeleted(p) => conversation_deleted(p, requester),
        BusEvent::MessageSent(p) => message_sent(p, requester),
    }
}

/// Whether `event` belongs on a subscription opened with `request` by
/// `requester`. Message subscriptions are additionally pinned to the
/// conversation they were opened for.
pub fn admits(request: &SubscriptionRequest, event: &BusEvent, requester: Option<Uuid>) -> bool {
    if request.topic() != event.topic() {
        return false;
    }
    if let (SubscriptionRequest::MessageSent { conversation_id }, BusEvent::MessageSent(p)) =
        (request, event)
    {
        if p.conversation_id != *conversation_id {
            return false;
        }
    }
    authorize(event, requester)
}

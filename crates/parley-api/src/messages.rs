use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::{NewMessage, SendOutcome};
use parley_gateway::EventBus;
use parley_types::api::SendMessageRequest;
use parley_types::events::{BusEvent, ConversationPayload, MessageSentPayload};
use parley_types::models::MessageView;

use crate::error::{ServiceError, ServiceResult, blocking};
use crate::session::Caller;
use crate::state::AppState;

#[derive(Clone)]
pub struct MessageService {
    db: Arc<Database>,
    bus: EventBus,
}

impl MessageService {
    pub fn new(db: Arc<Database>, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Store a message and move the conversation's latest-message projection
    /// onto it. Subscribers hear about it only once the write has committed.
    pub async fn send(
        &self,
        id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
        requester: Option<Uuid>,
    ) -> ServiceResult<bool> {
        if requester != Some(sender_id) {
            warn!("{:?} tried to send as {}", requester, sender_id);
            return Err(ServiceError::Unauthorized);
        }
        if body.trim().is_empty() {
            return Err(ServiceError::invalid("Message body must not be empty"));
        }

        let db = self.db.clone();
        let bus = self.bus.clone();
        // Published from inside the store unit, so the events go out in
        // commit order even if this future is dropped.
        let outcome = blocking(move || {
            let msg = NewMessage {
                id,
                conversation_id,
                sender_id,
                body: &body,
            };
            Ok(db.send_message(&msg, |message, conversation| {
                bus.publish(BusEvent::MessageSent(MessageSentPayload {
                    conversation_id,
                    message: message.clone(),
                    participants: conversation.participants.clone(),
                }));
                bus.publish(BusEvent::ConversationUpdated(ConversationPayload {
                    conversation: conversation.clone(),
                }));
            })?)
        })
        .await?;

        match outcome {
            SendOutcome::Sent { .. } => {}
            SendOutcome::ConversationNotFound => {
                return Err(ServiceError::not_found(format!(
                    "Conversation {} not found",
                    conversation_id
                )));
            }
            SendOutcome::NotParticipant => return Err(ServiceError::Unauthorized),
            SendOutcome::DuplicateId => {
                return Err(ServiceError::Conflict(format!("Message {} already exists", id)));
            }
        }

        debug!("{} sent message {} to {}", sender_id, id, conversation_id);
        Ok(true)
    }

    /// Messages of a conversation, newest first. Only participants may read.
    pub async fn list(
        &self,
        conversation_id: Uuid,
        requester: Option<Uuid>,
    ) -> ServiceResult<Vec<MessageView>> {
        let requester = requester.ok_or(ServiceError::Unauthorized)?;
        let db = self.db.clone();
        blocking(move || {
            if !db.conversation_exists(conversation_id)? {
                return Err(ServiceError::not_found(format!(
                    "Conversation {} not found",
                    conversation_id
                )));
            }
            if !db.is_participant(conversation_id, requester)? {
                return Err(ServiceError::Unauthorized);
            }
            Ok(db.list_messages(conversation_id)?)
        })
        .await
    }
}

// -- Handlers --

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<SendMessageRequest>,
) -> ServiceResult<impl IntoResponse> {
    let sent = state
        .messages
        .send(req.id, conversation_id, req.sender_id, req.body, caller.user_id())
        .await?;
    Ok((StatusCode::CREATED, Json(sent)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(caller): Extension<Caller>,
) -> ServiceResult<Json<Vec<MessageView>>> {
    Ok(Json(
        state
            .messages
            .list(conversation_id, caller.user_id())
            .await?,
    ))
}

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::EventBus;
use parley_types::api::{CreateConversationRequest, CreateConversationResponse, MarkReadRequest};
use parley_types::events::{BusEvent, ConversationDeletedPayload, ConversationPayload};
use parley_types::models::ConversationView;

use crate::error::{ServiceError, ServiceResult, blocking};
use crate::session::Caller;
use crate::state::AppState;

#[derive(Clone)]
pub struct ConversationService {
    db: Arc<Database>,
    bus: EventBus,
}

impl ConversationService {
    pub fn new(db: Arc<Database>, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Create a conversation between `participant_ids`. Only the requester
    /// starts out having seen the (empty) latest message.
    pub async fn create(
        &self,
        participant_ids: Vec<Uuid>,
        requester: Option<Uuid>,
    ) -> ServiceResult<Uuid> {
        let requester = requester.ok_or(ServiceError::Unauthorized)?;

        let mut members: Vec<Uuid> = Vec::with_capacity(participant_ids.len());
        for id in participant_ids {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        if members.len() < 2 {
            return Err(ServiceError::invalid(
                "A conversation needs at least two participants",
            ));
        }

        let db = self.db.clone();
        let bus = self.bus.clone();
        let id = Uuid::new_v4();
        let conversation = blocking(move || {
            if let Some(missing) = db.find_missing_user(&members)? {
                return Err(ServiceError::not_found(format!("User {} not found", missing)));
            }
            Ok(db.create_conversation(id, &members, requester, |conversation| {
                bus.publish(BusEvent::ConversationCreated(ConversationPayload {
                    conversation: conversation.clone(),
                }));
            })?)
        })
        .await?;

        info!(
            "{} created conversation {} with {} participants",
            requester,
            id,
            conversation.participants.len()
        );
        Ok(id)
    }

    pub async fn list(&self, requester: Option<Uuid>) -> ServiceResult<Vec<ConversationView>> {
        let requester = requester.ok_or(ServiceError::Unauthorized)?;
        let db = self.db.clone();
        blocking(move || Ok(db.list_conversations(requester)?)).await
    }

    /// Mark the conversation's latest message as seen by `user_id`.
    // TODO: derive the user from the requester once clients stop sending user_id
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        requester: Option<Uuid>,
    ) -> ServiceResult<bool> {
        requester.ok_or(ServiceError::Unauthorized)?;
        let db = self.db.clone();
        let updated =
            blocking(move || Ok(db.mark_conversation_read(conversation_id, user_id)?)).await?;
        if !updated {
            return Err(ServiceError::not_found(format!(
                "User {} is not in conversation {}",
                user_id, conversation_id
            )));
        }
        Ok(true)
    }

    /// Delete the conversation with all its messages and participants and tell
    /// the former participants once that has committed.
    pub async fn delete(&self, conversation_id: Uuid, requester: Option<Uuid>) -> ServiceResult<bool> {
        let requester = requester.ok_or(ServiceError::Unauthorized)?;
        let db = self.db.clone();
        let bus = self.bus.clone();
        let deleted = blocking(move || {
            Ok(db.delete_conversation(conversation_id, |snapshot| {
                bus.publish(BusEvent::ConversationDeleted(ConversationDeletedPayload {
                    id: snapshot.id,
                    participants: snapshot.participants.clone(),
                }));
            })?)
        })
        .await?;
        if deleted.is_none() {
            return Err(ServiceError::not_found(format!(
                "Conversation {} not found",
                conversation_id
            )));
        }

        info!("{} deleted conversation {}", requester, conversation_id);
        Ok(true)
    }
}

// -- Handlers --

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateConversationRequest>,
) -> ServiceResult<impl IntoResponse> {
    let conversation_id = state
        .conversations
        .create(req.participant_ids, caller.user_id())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateConversationResponse { conversation_id }),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ServiceResult<Json<Vec<ConversationView>>> {
    Ok(Json(state.conversations.list(caller.user_id()).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<MarkReadRequest>,
) -> ServiceResult<Json<bool>> {
    let done = state
        .conversations
        .mark_read(conversation_id, req.user_id, caller.user_id())
        .await?;
    Ok(Json(done))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(caller): Extension<Caller>,
) -> ServiceResult<Json<bool>> {
    Ok(Json(
        state
            .conversations
            .delete(conversation_id, caller.user_id())
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_db::models::NewMessage;
    use parley_types::events::Topic;
    use std::time::Duration;

    fn setup() -> (Arc<Database>, EventBus, ConversationService) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        let service = ConversationService::new(db.clone(), bus.clone());
        (db, bus, service)
    }

    fn users(db: &Database, n: usize) -> Vec<Uuid> {
        (0..n)
            .map(|i| {
                let id = Uuid::new_v4();
                db.create_user(id, Some(&format!("user{}", i))).unwrap();
                id
            })
            .collect()
    }

    #[tokio::test]
    async fn create_requires_a_session() {
        let (db, _, service) = setup();
        let ids = users(&db, 2);
        let err = service.create(ids, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn create_rejects_fewer_than_two_without_publishing() {
        let (db, bus, service) = setup();
        let ids = users(&db, 1);
        let mut created = bus.subscribe(Topic::ConversationCreated);

        let err = service.create(vec![ids[0]], Some(ids[0])).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let err = service
            .create(vec![ids[0], ids[0]], Some(ids[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        assert!(db.list_conversations(ids[0]).unwrap().is_empty());
        assert!(created.try_recv().is_none());
    }

    #[tokio::test]
    async fn create_rejects_unknown_users() {
        let (db, _, service) = setup();
        let ids = users(&db, 1);
        let stranger = Uuid::new_v4();

        let err = service
            .create(vec![ids[0], stranger], Some(ids[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(db.list_conversations(ids[0]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_publishes_the_populated_conversation() {
        let (db, bus, service) = setup();
        let ids = users(&db, 2);
        let mut created = bus.subscribe(Topic::ConversationCreated);

        let id = service.create(ids.clone(), Some(ids[1])).await.unwrap();

        let Some(BusEvent::ConversationCreated(payload)) = created.recv().await else {
            panic!("expected ConversationCreated");
        };
        assert_eq!(payload.conversation.id, id);
        assert_eq!(payload.conversation.participants.len(), 2);
        let seen: Vec<Uuid> = payload.conversation.seen_by().map(|p| p.user.id).collect();
        assert_eq!(seen, vec![ids[1]]);
    }

    #[tokio::test]
    async fn mark_read_sets_the_flag_and_is_idempotent() {
        let (db, _, service) = setup();
        let ids = users(&db, 2);
        let cid = service.create(ids.clone(), Some(ids[0])).await.unwrap();

        for _ in 0..2 {
            assert!(service.mark_read(cid, ids[1], Some(ids[1])).await.unwrap());
        }
        let conversation = db.get_conversation(cid).unwrap().unwrap();
        assert_eq!(conversation.seen_by().count(), 2);
    }

    #[tokio::test]
    async fn mark_read_reports_missing_participant() {
        let (db, _, service) = setup();
        let ids = users(&db, 2);
        let err = service
            .mark_read(Uuid::new_v4(), ids[0], Some(ids[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = service.mark_read(Uuid::new_v4(), ids[0], None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn delete_publishes_snapshot_once() {
        let (db, bus, service) = setup();
        let ids = users(&db, 3);
        let cid = service.create(ids.clone(), Some(ids[0])).await.unwrap();
        let mut deleted = bus.subscribe(Topic::ConversationDeleted);

        assert!(service.delete(cid, Some(ids[2])).await.unwrap());
        assert!(db.get_conversation(cid).unwrap().is_none());

        let Some(BusEvent::ConversationDeleted(payload)) = deleted.recv().await else {
            panic!("expected ConversationDeleted");
        };
        assert_eq!(payload.id, cid);
        let mut members: Vec<Uuid> = payload.participants.iter().map(|p| p.user.id).collect();
        let mut expected = ids.clone();
        members.sort();
        expected.sort();
        assert_eq!(members, expected);

        let err = service.delete(cid, Some(ids[0])).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(deleted.try_recv().is_none());
    }

    fn fail_on(db: &Database, trigger: &str) {
        db.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TRIGGER injected_failure {trigger}
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;"
            ))?;
            Ok(())
        })
        .unwrap();
    }

    fn conversation_rows(db: &Database) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?)
        })
        .unwrap()
    }

    #[tokio::test]
    async fn store_failure_mid_create_publishes_nothing() {
        let (db, bus, service) = setup();
        let ids = users(&db, 2);
        let mut created = bus.subscribe(Topic::ConversationCreated);
        fail_on(&db, "BEFORE INSERT ON participants");

        let err = service.create(ids.clone(), Some(ids[0])).await.unwrap_err();

        assert!(matches!(err, ServiceError::Store(_)));
        assert_eq!(conversation_rows(&db), 0);
        assert!(created.try_recv().is_none());
    }

    #[tokio::test]
    async fn store_failure_mid_delete_keeps_everything() {
        let (db, bus, service) = setup();
        let ids = users(&db, 3);
        let cid = service.create(ids.clone(), Some(ids[0])).await.unwrap();
        let msg = NewMessage {
            id: Uuid::new_v4(),
            conversation_id: cid,
            sender_id: ids[1],
            body: "still here",
        };
        db.send_message(&msg, |_, _| {}).unwrap();
        let mut deleted = bus.subscribe(Topic::ConversationDeleted);
        // Messages go first, so this fails after the unit has started deleting
        fail_on(&db, "BEFORE DELETE ON participants");

        let err = service.delete(cid, Some(ids[0])).await.unwrap_err();

        assert!(matches!(err, ServiceError::Store(_)));
        let conversation = db.get_conversation(cid).unwrap().unwrap();
        assert_eq!(conversation.latest_message_id, Some(msg.id));
        assert_eq!(conversation.participants.len(), 3);
        assert_eq!(db.list_messages(cid).unwrap().len(), 1);
        assert!(deleted.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_delete_still_publishes_its_commit() {
        let (db, bus, service) = setup();
        let ids = users(&db, 2);
        let cid = service.create(ids.clone(), Some(ids[0])).await.unwrap();
        let mut deleted = bus.subscribe(Topic::ConversationDeleted);

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder_db = db.clone();
        let holder = std::thread::spawn(move || {
            holder_db
                .with_conn(|_| {
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(())
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();

        let attempt =
            tokio::time::timeout(Duration::from_millis(50), service.delete(cid, Some(ids[0]))).await;
        assert!(attempt.is_err(), "delete finished while the store was locked");

        let delivered = tokio::time::timeout(Duration::from_secs(2), deleted.recv())
            .await
            .expect("committed deletion was never published");
        assert!(matches!(delivered, Some(BusEvent::ConversationDeleted(p)) if p.id == cid));

        holder.join().unwrap();
        assert!(db.get_conversation(cid).unwrap().is_none());
    }
}

pub mod conversations;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod session;
pub mod state;
pub mod users;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

pub use error::{ServiceError, ServiceResult};
pub use state::{AppState, AppStateInner};

/// Every HTTP and gateway route, with the session resolved up front.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/conversations",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route("/conversations/{conversation_id}", delete(conversations::delete_conversation))
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route(
            "/conversations/{conversation_id}/messages",
            post(messages::send_message).get(messages::get_messages),
        )
        .route("/users/search", get(users::search_users))
        .route("/users/username", post(users::create_username))
        .route("/gateway", get(gateway::upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), session::resolve_session))
        .with_state(state)
}

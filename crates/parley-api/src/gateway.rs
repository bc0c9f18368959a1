use axum::{
    Extension,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use parley_gateway::connection;

use crate::session::Caller;
use crate::state::AppState;

/// Upgrade to the subscription gateway. The caller's identity is fixed for
/// the lifetime of the connection.
pub async fn upgrade(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let bus = state.bus.clone();
    let shutdown = state.shutdown_signal();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, bus, caller.0, shutdown))
}

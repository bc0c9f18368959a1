use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
};
use tracing::{error, info};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::UsernameOutcome;
use parley_types::api::{CreateUsernameRequest, CreateUsernameResponse, SearchUsersQuery};
use parley_types::models::UserSummary;

use crate::error::{ServiceError, ServiceResult, blocking};
use crate::session::Caller;
use crate::state::AppState;

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;

#[derive(Clone)]
pub struct UserService {
    db: Arc<Database>,
}

impl UserService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Users whose name contains `term`, ignoring case. The requester is
    /// never part of the result.
    pub async fn search(
        &self,
        term: Option<String>,
        requester: Option<Uuid>,
    ) -> ServiceResult<Vec<UserSummary>> {
        let requester = requester.ok_or(ServiceError::Unauthorized)?;
        let term = term
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::invalid("Search term must not be empty"))?;

        let db = self.db.clone();
        blocking(move || Ok(db.search_users(&term, requester)?)).await
    }

    /// Claim a username for the requester. Failures come back in the
    /// response rather than as errors.
    pub async fn create_username(
        &self,
        username: String,
        requester: Option<Uuid>,
    ) -> CreateUsernameResponse {
        let Some(requester) = requester else {
            return CreateUsernameResponse::failed(ServiceError::Unauthorized.to_string());
        };
        let username = username.trim().to_owned();
        let len = username.chars().count();
        if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
            return CreateUsernameResponse::failed(format!(
                "Username must be between {} and {} characters",
                USERNAME_MIN, USERNAME_MAX
            ));
        }

        let db = self.db.clone();
        let name = username.clone();
        match blocking(move || Ok(db.set_username(requester, &name)?)).await {
            Ok(UsernameOutcome::Updated) => {
                info!("{} is now known as {}", requester, username);
                CreateUsernameResponse::ok()
            }
            Ok(UsernameOutcome::Taken) => CreateUsernameResponse::failed("Username already exists"),
            Err(e) => {
                error!("Failed to set username for {}: {}", requester, e);
                CreateUsernameResponse::failed(e.to_string())
            }
        }
    }
}

// -- Handlers --

pub async fn search_users(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<SearchUsersQuery>,
) -> ServiceResult<Json<Vec<UserSummary>>> {
    Ok(Json(
        state
            .users
            .search(query.username, caller.user_id())
            .await?,
    ))
}

pub async fn create_username(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateUsernameRequest>,
) -> Json<CreateUsernameResponse> {
    Json(
        state
            .users
            .create_username(req.username, caller.user_id())
            .await,
    )
}

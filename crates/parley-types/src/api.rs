use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// Claims of the session tokens issued by the external auth service. Verified
/// once by the parley-api session middleware, for REST calls and gateway
/// upgrades alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    pub exp: usize,
}

/// Authenticated caller identity, resolved from verified claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub username: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username,
            expires_at: i64::try_from(claims.exp)
                .ok()
                .and_then(|exp| DateTime::from_timestamp(exp, 0))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub user_id: Uuid,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
}

// -- Users --

#[derive(Debug, Deserialize)]
pub struct SearchUsersQuery {
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUsernameRequest {
    pub username: String,
}

/// Field-level outcome of `createUsername`; failures are reported here rather
/// than as an error status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUsernameResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl CreateUsernameResponse {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { success: false, error: Some(reason.into()) }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use parley_types::api::{Claims, Session};

use crate::state::AppState;

/// Identity of whoever made the request, if anyone. Inserted by
/// [`resolve_session`] on every route.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<Session>);

impl Caller {
    pub fn user_id(&self) -> Option<Uuid> {
        self.0.as_ref().map(|s| s.user_id)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Verify a session token. Expired, malformed or wrongly signed tokens
/// yield `None`.
pub fn decode_token(token: &str, secret: &str) -> Option<Session> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(Session::from(data.claims)),
        Err(e) => {
            debug!("Rejected session token: {}", e);
            None
        }
    }
}

/// Resolve the caller from `Authorization: Bearer`, falling back to a
/// `token` query parameter (browsers cannot set headers on WebSocket
/// upgrades). Never rejects: unauthenticated requests carry an empty
/// [`Caller`] and the services decide.
pub async fn resolve_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = match req.headers().typed_get::<Authorization<Bearer>>() {
        Some(auth) => Some(auth.token().to_owned()),
        None => Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token),
    };

    let session = token.and_then(|t| decode_token(&t, &state.jwt_secret));
    req.extensions_mut().insert(Caller(session));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, exp: usize) -> (Uuid, String) {
        let sub = Uuid::new_v4();
        let claims = Claims {
            sub,
            username: Some("alice".into()),
            exp,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .unwrap();
        (sub, token)
    }

    fn in_an_hour() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn valid_token_yields_session() {
        let (sub, token) = token("secret", in_an_hour());
        let session = decode_token(&token, "secret").unwrap();
        assert_eq!(session.user_id, sub);
        assert_eq!(session.username.as_deref(), Some("alice"));
        assert!(session.expires_at > chrono::Utc::now());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (_, token) = token("secret", in_an_hour());
        assert!(decode_token(&token, "other").is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let (_, token) = token("secret", 1_000);
        assert!(decode_token(&token, "secret").is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_token("not-a-jwt", "secret").is_none());
    }
}

//! Authenticated identity, injected upstream by the auth layer as
//! `X-Auth-User` / `X-Auth-User-Id` headers. Token issuance and
//! verification live outside this service.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let username = header("x-auth-user").ok_or((
            StatusCode::UNAUTHORIZED,
            "missing authenticated user identity".to_string(),
        ))?;
        let user_id = header("x-auth-user-id").unwrap_or_else(|| username.clone());
        Ok(Self { user_id, username })
    }
}

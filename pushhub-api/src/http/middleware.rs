// HTTP middleware

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use pushhub_core::Principal;

use super::{AppError, AppState};

/// Header carrying the client token
pub const CLIENT_TOKEN_HEADER: &str = "x-pushhub-key";

/// Client authenticated by the external auth collaborator
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let token = extract_token(parts)
            .ok_or_else(|| AppError::unauthorized("Missing client token"))?;

        let principal = app_state.authenticator.authenticate(&token).await?;
        Ok(Self(principal))
    }
}

/// Client token from the `X-Pushhub-Key` header, the `token` query parameter,
/// or an `Authorization: Bearer` header, in that order.
pub(crate) fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(CLIENT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }

    if let Some(query) = parts.uri.query() {
        if let Some((_, value)) = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, value)| key == "token" && !value.is_empty())
        {
            return Some(value.into_owned());
        }
    }

    let authorization = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = authorization.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

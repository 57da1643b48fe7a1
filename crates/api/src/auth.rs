//! Authenticated-user extraction
//!
//! Token issuance and verification are handled by the auth layer in front
//! of this service; by the time a request reaches us the gateway has
//! resolved the caller and forwards the user id in a trusted header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller, as asserted by the upstream auth layer.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("User not authenticated"))?;

        let user_id = header
            .parse::<Uuid>()
            .map_err(|_| ApiError::unauthorized("Invalid user identity"))?;
        Ok(AuthenticatedUser(user_id))
    }
}

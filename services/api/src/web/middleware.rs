//! services/api/src/web/middleware.rs
//!
//! Identifies the caller. Children may read as guests, so the user header is
//! optional; a header that is present must be a valid UUID.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tracing::warn;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The signed-in user, or `None` for a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserId(pub Option<Uuid>);

/// Parses the optional user header into a [`UserId`] request extension.
pub fn parse_user_id(value: Option<&str>) -> Result<UserId, StatusCode> {
    match value {
        None => Ok(UserId(None)),
        Some(raw) => Uuid::parse_str(raw.trim()).map(|id| UserId(Some(id))).map_err(|_| {
            warn!("Rejected malformed {} header.", USER_ID_HEADER);
            StatusCode::BAD_REQUEST
        }),
    }
}

/// Middleware that inserts the caller's [`UserId`] into request extensions.
pub async fn identify_user(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let header = req
        .headers()
        .get(USER_ID_HEADER)
        .map(|v| v.to_str().map_err(|_| StatusCode::BAD_REQUEST))
        .transpose()?;
    let user_id = parse_user_id(header)?;
    req.extensions_mut().insert(user_id);
    Ok(next.run(req).await)
}

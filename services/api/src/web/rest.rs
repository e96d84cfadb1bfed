//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use ecokids_core::domain::ChatMessage;
use ecokids_core::ports::PortError;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_messages_handler,
    ),
    components(
        schemas(ChatMessageResponse)
    ),
    tags(
        (name = "EcoKids API", description = "Conversation history for the EcoKids assistant.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response Structs
//=========================================================================================

/// One persisted chat message, in conversation order.
#[derive(Serialize, ToSchema, Debug, PartialEq)]
pub struct ChatMessageResponse {
    pub id: Uuid,
    /// `user`, `assistant` or `tool`.
    pub role: String,
    pub text_content: String,
    #[schema(value_type = Object)]
    pub raw_content: Value,
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage> for ChatMessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            id: message.id,
            role: message.role.as_str().to_string(),
            text_content: message.text_content,
            raw_content: message.raw_content,
            created_at: message.created_at,
        }
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List every message of a conversation, oldest first.
#[utoipa::path(
    get,
    path = "/conversations/{conversation_id}/messages",
    responses(
        (status = 200, description = "The ordered message log", body = [ChatMessageResponse]),
        (status = 404, description = "Conversation not found"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("conversation_id" = Uuid, Path, description = "The conversation to read."),
        ("x-user-id" = Option<Uuid>, Header, description = "The signed-in user, if any.")
    )
)]
pub async fn list_messages_handler(
    State(app_state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessageResponse>>, (StatusCode, String)> {
    match app_state.conversations.list_ordered(conversation_id).await {
        Ok(messages) => Ok(Json(messages.into_iter().map(Into::into).collect())),
        Err(PortError::NotFound(what)) => Err((StatusCode::NOT_FOUND, what)),
        Err(e) => {
            error!(%conversation_id, "Failed to list messages: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list messages".to_string(),
            ))
        }
    }
}

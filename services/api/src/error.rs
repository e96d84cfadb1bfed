//! services/api/src/error.rs
//!
//! Startup and request failures of the EcoKids service.

use crate::config::ConfigError;
use ecokids_core::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A story, chat or speech port failed outside of a session.
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The schema in `migrations/` could not be applied at startup.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("WebSocket error: {0}")]
    Websocket(#[from] axum::Error),

    /// Binding the listener or serving connections failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

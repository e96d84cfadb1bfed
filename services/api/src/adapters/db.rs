//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of the
//! story and conversation storage ports from the `core` crate. It handles all
//! interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecokids_core::domain::{
    AudioVariant, ChatConversation, ChatMessage, Language, MessageRole, StorySegment,
    VoiceGender,
};
use ecokids_core::ports::{
    ConversationLog, PortError, PortResult, ProgressLogger, ResumeStore, SegmentStore,
    ViewCounter,
};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements every storage port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct SegmentRecord {
    id: Uuid,
    story_id: Uuid,
    segment_index: i32,
    text_vi: Option<String>,
    text_en: Option<String>,
    image_url: Option<String>,
}

impl SegmentRecord {
    fn to_domain(self, audio_variants: Vec<AudioVariant>) -> StorySegment {
        let mut text_by_language = HashMap::new();
        if let Some(text) = self.text_vi {
            text_by_language.insert(Language::Vi, text);
        }
        if let Some(text) = self.text_en {
            text_by_language.insert(Language::En, text);
        }
        StorySegment {
            id: self.id,
            story_id: self.story_id,
            index: self.segment_index.max(0) as u32,
            text_by_language,
            image_url: self.image_url,
            audio_variants,
        }
    }
}

#[derive(FromRow)]
struct AudioRecord {
    segment_id: Uuid,
    language: String,
    gender: String,
    audio_url: String,
}

impl AudioRecord {
    /// Rows with an unknown language or gender are skipped.
    fn to_domain(self) -> Option<(Uuid, AudioVariant)> {
        let language = Language::from_code(&self.language)?;
        let gender = VoiceGender::from_code(&self.gender)?;
        Some((
            self.segment_id,
            AudioVariant {
                language,
                gender,
                audio_url: self.audio_url,
            },
        ))
    }
}

#[derive(FromRow)]
struct ConversationRecord {
    id: Uuid,
    user_id: Option<Uuid>,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    fn to_domain(self) -> ChatConversation {
        ChatConversation {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    raw_content: Value,
    text_content: String,
    created_at: DateTime<Utc>,
}

impl MessageRecord {
    fn to_domain(self) -> PortResult<ChatMessage> {
        let role = MessageRole::parse(&self.role).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown message role '{}' on {}", self.role, self.id))
        })?;
        Ok(ChatMessage {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            raw_content: self.raw_content,
            text_content: self.text_content,
            created_at: self.created_at,
        })
    }
}

//=========================================================================================
// Story Reading Ports
//=========================================================================================

#[async_trait]
impl SegmentStore for DbAdapter {
    async fn fetch_segments(&self, story_id: Uuid) -> PortResult<Vec<StorySegment>> {
        let records = sqlx::query_as::<_, SegmentRecord>(
            "SELECT id, story_id, segment_index, text_vi, text_en, image_url
             FROM story_segments WHERE story_id = $1 ORDER BY segment_index ASC",
        )
        .bind(story_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let segment_ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let audio = sqlx::query_as::<_, AudioRecord>(
            "SELECT segment_id, language, gender, audio_url
             FROM segment_audio WHERE segment_id = ANY($1)",
        )
        .bind(&segment_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let mut variants: HashMap<Uuid, Vec<AudioVariant>> = HashMap::new();
        for (segment_id, variant) in audio.into_iter().filter_map(AudioRecord::to_domain) {
            variants.entry(segment_id).or_default().push(variant);
        }

        debug!(%story_id, pages = records.len(), "Fetched story segments.");
        Ok(records
            .into_iter()
            .map(|r| {
                let audio_variants = variants.remove(&r.id).unwrap_or_default();
                r.to_domain(audio_variants)
            })
            .collect())
    }
}

#[async_trait]
impl ViewCounter for DbAdapter {
    async fn increment_view_count(&self, story_id: Uuid) -> PortResult<()> {
        let result = sqlx::query("UPDATE stories SET view_count = view_count + 1 WHERE id = $1")
            .bind(story_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Story {} not found", story_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressLogger for DbAdapter {
    async fn log_progress(&self, story_id: Uuid, segment_id: Uuid, user_id: Uuid) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO reading_progress (user_id, story_id, segment_id) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(story_id)
        .bind(segment_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for DbAdapter {
    async fn mark_resumable(
        &self,
        user_id: Option<Uuid>,
        story_id: Uuid,
        page_index: usize,
    ) -> PortResult<()> {
        // Guests have nowhere to resume from.
        let Some(user_id) = user_id else {
            return Ok(());
        };
        let page_index = i32::try_from(page_index)
            .map_err(|_| PortError::Unexpected(format!("Page index {} is out of range", page_index)))?;
        sqlx::query(
            "INSERT INTO resume_points (user_id, story_id, page_index, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (user_id, story_id)
             DO UPDATE SET page_index = EXCLUDED.page_index, updated_at = EXCLUDED.updated_at",
        )
        .bind(user_id)
        .bind(story_id)
        .bind(page_index)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }
}

//=========================================================================================
// Conversation Log Port
//=========================================================================================

#[async_trait]
impl ConversationLog for DbAdapter {
    async fn create_conversation(
        &self,
        user_id: Option<Uuid>,
        title: Option<&str>,
    ) -> PortResult<ChatConversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "INSERT INTO conversations (id, user_id, title) VALUES ($1, $2, $3)
             RETURNING id, user_id, title, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn append(&self, message: &ChatMessage) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        sqlx::query(
            "INSERT INTO chat_messages (id, conversation_id, role, raw_content, text_content, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.raw_content)
        .bind(&message.text_content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => PortError::NotFound(
                format!("Conversation {} not found", message.conversation_id),
            ),
            other => unexpected(other),
        })?;

        sqlx::query("UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1")
            .bind(message.conversation_id)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn list_ordered(&self, conversation_id: Uuid) -> PortResult<Vec<ChatMessage>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            "SELECT id, conversation_id, role, raw_content, text_content, created_at
             FROM chat_messages WHERE conversation_id = $1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        if records.is_empty() {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)")
                    .bind(conversation_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(unexpected)?;
            if !exists {
                return Err(PortError::NotFound(format!("conversation {}", conversation_id)));
            }
        }

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            match record.to_domain() {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping unreadable chat message: {}", e),
            }
        }
        Ok(messages)
    }
}

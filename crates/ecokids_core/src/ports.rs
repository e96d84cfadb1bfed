//! crates/ecokids_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture: the reading
//! and chat sessions are written against them, and the `api` service supplies
//! database, model and client-device implementations.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{ChatConversation, ChatMessage, Language, ModelMessage, StorySegment, VoiceGender};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    /// The operation was cancelled through its abort token. Not a failure.
    #[error("Operation aborted")]
    Aborted,
}

impl PortError {
    pub fn is_abort(&self) -> bool {
        matches!(self, PortError::Aborted)
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Story Reading Ports
//=========================================================================================

#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Fetches every segment of a story, ordered by `index`.
    async fn fetch_segments(&self, story_id: Uuid) -> PortResult<Vec<StorySegment>>;
}

#[async_trait]
pub trait ViewCounter: Send + Sync {
    async fn increment_view_count(&self, story_id: Uuid) -> PortResult<()>;
}

#[async_trait]
pub trait ProgressLogger: Send + Sync {
    /// Records that `user_id` reached `segment_id`.
    async fn log_progress(&self, story_id: Uuid, segment_id: Uuid, user_id: Uuid) -> PortResult<()>;
}

/// The "continue reading" store behind the home screen.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn mark_resumable(
        &self,
        user_id: Option<Uuid>,
        story_id: Uuid,
        page_index: usize,
    ) -> PortResult<()>;
}

#[async_trait]
pub trait ImagePreloader: Send + Sync {
    /// Resolves once every image has been decoded by the client.
    async fn preload(&self, urls: &[String]) -> PortResult<()>;
}

/// The page-flipper on screen. Turning a page makes the UI report `PageFlipped`.
pub trait PageTurner: Send + Sync {
    fn turn_to(&self, page_index: usize);
}

/// How a playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The audio played to the end.
    Finished,
    /// A `stop_all` cut it short.
    Stopped,
}

/// The process-wide speaker. Callers must `stop_all` before starting their own playback.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, url: &str) -> PortResult<PlaybackEnd>;
    async fn synthesize_and_play(
        &self,
        text: &str,
        gender: VoiceGender,
        language: Language,
    ) -> PortResult<PlaybackEnd>;
    async fn stop_all(&self);
}

//=========================================================================================
// Chat Ports
//=========================================================================================

/// The JSON-schema description of a tool offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A side-effecting function the model may invoke mid-stream.
#[async_trait]
pub trait ChatTool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, arguments: Value) -> PortResult<Value>;
}

/// Everything the model needs for one streamed turn.
#[derive(Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    /// Prior messages of the conversation, oldest first.
    pub history: Vec<ChatMessage>,
    pub message: String,
    pub tools: Vec<Arc<dyn ChatTool>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A piece of assistant text, in order.
    TextDelta(String),
    /// The stream completed; carries every message the model produced this turn.
    Finished { messages: Vec<ModelMessage> },
}

pub type ModelStream = Pin<Box<dyn Stream<Item = PortResult<StreamEvent>> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Opens a streaming completion. Cancelling `abort` ends the stream with `PortError::Aborted`.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        abort: CancellationToken,
    ) -> PortResult<ModelStream>;
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn create_conversation(
        &self,
        user_id: Option<Uuid>,
        title: Option<&str>,
    ) -> PortResult<ChatConversation>;
    async fn append(&self, message: &ChatMessage) -> PortResult<()>;
    /// Every message of the conversation ordered by `created_at`.
    async fn list_ordered(&self, conversation_id: Uuid) -> PortResult<Vec<ChatMessage>>;
}

/// Sequential spoken playback of chat sentences.
#[async_trait]
pub trait TtsQueue: Send + Sync {
    async fn enqueue(&self, text: &str, locale: &str) -> PortResult<()>;
    /// Drops queued sentences and stops whatever is speaking.
    async fn clear(&self);
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn start(&self, locale: &str) -> PortResult<()>;
    /// Stops recording and returns the recognized text.
    async fn stop(&self) -> PortResult<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoryMatch {
    pub story_id: Uuid,
    pub title: String,
    pub content: String,
    pub similarity: f32,
}

#[async_trait]
pub trait StorySearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> PortResult<Vec<StoryMatch>>;
}

/// Asks the UI to open a story screen.
pub trait StoryNavigator: Send + Sync {
    fn open_story(&self, story_id: Uuid);
}

//=========================================================================================
// Speech Service Ports
//=========================================================================================

#[async_trait]
pub trait TextToSpeechService: Send + Sync {
    /// Generates encoded audio for `text` in the voice matching `gender`.
    async fn generate_audio(
        &self,
        text: &str,
        gender: VoiceGender,
        language: Language,
    ) -> PortResult<Bytes>;
}

#[async_trait]
pub trait SpeechToTextService: Send + Sync {
    /// Transcribes raw 16-bit PCM audio into text.
    async fn transcribe_audio(&self, audio_data: &[u8], locale: &str) -> PortResult<String>;
}

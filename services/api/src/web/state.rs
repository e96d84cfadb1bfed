//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use ecokids_core::ports::{
    ConversationLog, ModelClient, ProgressLogger, ResumeStore, SegmentStore,
    SpeechToTextService, StorySearch, TextToSpeechService, ViewCounter,
};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub segments: Arc<dyn SegmentStore>,
    pub views: Arc<dyn ViewCounter>,
    pub progress: Arc<dyn ProgressLogger>,
    pub resume: Arc<dyn ResumeStore>,
    pub conversations: Arc<dyn ConversationLog>,
    pub model: Arc<dyn ModelClient>,
    pub search: Arc<dyn StorySearch>,
    pub tts_adapter: Arc<dyn TextToSpeechService>,
    pub sst_adapter: Arc<dyn SpeechToTextService>,
    /// Resolved once at startup from the prompts directory.
    pub system_prompt: String,
}

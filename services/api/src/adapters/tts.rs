//! services/api/src/adapters/tts.rs
//!
//! This module contains the adapter for OpenAI's Text-to-Speech (TTS) service.
//! It implements the `TextToSpeechService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::audio::{CreateSpeechRequest, SpeechModel, Voice},
    Client,
};
use async_trait::async_trait;
use bytes::Bytes;
use ecokids_core::domain::{Language, VoiceGender};
use ecokids_core::ports::{PortError, PortResult, TextToSpeechService};
use tracing::debug;

use crate::config::ConfigError;

/// Maps a configured voice name onto an OpenAI voice.
pub fn parse_voice(var: &str, name: &str) -> Result<Voice, ConfigError> {
    match name.to_lowercase().as_str() {
        "alloy" => Ok(Voice::Alloy),
        "echo" => Ok(Voice::Echo),
        "fable" => Ok(Voice::Fable),
        "onyx" => Ok(Voice::Onyx),
        "nova" => Ok(Voice::Nova),
        "shimmer" => Ok(Voice::Shimmer),
        _ => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("'{}' is not a supported voice", name),
        )),
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `TextToSpeechService` port using the OpenAI TTS API.
#[derive(Clone)]
pub struct OpenAiTtsAdapter {
    client: Client<OpenAIConfig>,
    model: SpeechModel,
    female_voice: Voice,
    male_voice: Voice,
}

impl OpenAiTtsAdapter {
    /// Creates a new `OpenAiTtsAdapter`.
    pub fn new(
        client: Client<OpenAIConfig>,
        model: SpeechModel,
        female_voice: Voice,
        male_voice: Voice,
    ) -> Self {
        Self {
            client,
            model,
            female_voice,
            male_voice,
        }
    }

    fn voice_for(&self, gender: VoiceGender) -> Voice {
        match gender {
            VoiceGender::Female => self.female_voice.clone(),
            VoiceGender::Male => self.male_voice.clone(),
        }
    }
}

//=========================================================================================
// `TextToSpeechService` Trait Implementation
//=========================================================================================

#[async_trait]
impl TextToSpeechService for OpenAiTtsAdapter {
    /// Generates MP3 audio for the given text. The voices are multilingual, so the
    /// language only shows up in the logs.
    async fn generate_audio(
        &self,
        text: &str,
        gender: VoiceGender,
        language: Language,
    ) -> PortResult<Bytes> {
        debug!(language = language.code(), gender = gender.code(), chars = text.len(), "Synthesizing speech.");
        let request = CreateSpeechRequest {
            model: self.model.clone(),
            input: text.to_string(),
            voice: self.voice_for(gender),
            ..Default::default()
        };

        let response = self
            .client
            .audio()
            .speech()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        Ok(response.bytes)
    }
}

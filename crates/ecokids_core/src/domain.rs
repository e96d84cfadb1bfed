//! crates/ecokids_core/src/domain.rs
//!
//! Defines the core data structures for stories and chat conversations.
//! These structs carry no database or transport concerns; the small enums
//! derive `serde` so that adapters can reuse their lowercase wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

//=========================================================================================
// Story Reading
//=========================================================================================

/// A reading language. Every story carries text for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Vi,
    En,
}

impl Language {
    pub fn toggled(self) -> Self {
        match self {
            Language::Vi => Language::En,
            Language::En => Language::Vi,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::Vi => "vi",
            Language::En => "en",
        }
    }

    /// The BCP-47 locale used for speech synthesis and recognition.
    pub fn locale(self) -> &'static str {
        match self {
            Language::Vi => "vi-VN",
            Language::En => "en-US",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "vi" => Some(Language::Vi),
            "en" => Some(Language::En),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    Male,
    Female,
}

impl VoiceGender {
    pub fn code(self) -> &'static str {
        match self {
            VoiceGender::Male => "male",
            VoiceGender::Female => "female",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "male" => Some(VoiceGender::Male),
            "female" => Some(VoiceGender::Female),
            _ => None,
        }
    }
}

/// A pre-rendered narration of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioVariant {
    pub language: Language,
    pub gender: VoiceGender,
    pub audio_url: String,
}

/// One page of a story. Segments are immutable once fetched for a session.
#[derive(Debug, Clone)]
pub struct StorySegment {
    pub id: Uuid,
    pub story_id: Uuid,
    pub index: u32,
    pub text_by_language: HashMap<Language, String>,
    pub image_url: Option<String>,
    pub audio_variants: Vec<AudioVariant>,
}

impl StorySegment {
    pub fn text(&self, language: Language) -> Option<&str> {
        self.text_by_language.get(&language).map(String::as_str)
    }

    /// The pre-rendered narration matching both language and voice, if any.
    pub fn audio_url(&self, language: Language, gender: VoiceGender) -> Option<&str> {
        self.audio_variants
            .iter()
            .find(|v| v.language == language && v.gender == gender)
            .map(|v| v.audio_url.as_str())
    }
}

//=========================================================================================
// Chat
//=========================================================================================

#[derive(Debug, Clone)]
pub struct ChatConversation {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

/// A message produced by the model during one streamed turn, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMessage {
    pub role: MessageRole,
    /// The serialized model message, e.g. an assistant message carrying tool calls.
    pub raw_content: Value,
}

/// A persisted entry in a conversation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub raw_content: Value,
    /// Cached display text, always derivable from `raw_content`.
    pub text_content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        conversation_id: Uuid,
        role: MessageRole,
        raw_content: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        let text_content = flatten_content(&raw_content);
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            raw_content,
            text_content,
            created_at,
        }
    }

    /// A user message whose raw content is just the submitted text.
    pub fn from_user_text(conversation_id: Uuid, text: &str, created_at: DateTime<Utc>) -> Self {
        Self::new(
            conversation_id,
            MessageRole::User,
            Value::String(text.to_string()),
            created_at,
        )
    }
}

/// Flattens a raw model message into display text.
///
/// Accepts a bare string, an object with a `content` field, or an array of
/// content parts. Only `text` parts and tool `output`/`result` payloads that are
/// themselves text contribute; tool-call arguments are not shown.
pub fn flatten_content(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(flatten_content)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(""),
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                return flatten_content(content);
            }
            if let Some(Value::String(text)) = map.get("text") {
                return text.clone();
            }
            for key in ["output", "result"] {
                if let Some(Value::String(text)) = map.get(key) {
                    return text.clone();
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

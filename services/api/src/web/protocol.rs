//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the EcoKids app and the API
//! server. One socket carries a reading session and a chat session.

use ecokids_core::chat::ChatStatus;
use ecokids_core::domain::{Language, VoiceGender};
use ecokids_core::story::{StorySnapshot, StoryState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client (App) TO the Server
//=========================================================================================
// NOTE: Microphone audio is sent as raw Binary frames while listening, not as part of
// this enum.
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a story, replacing any story already open on this connection.
    OpenStory {
        story_id: Uuid,
        #[serde(default)]
        language: Option<Language>,
        #[serde(default)]
        voice_gender: Option<VoiceGender>,
        #[serde(default)]
        auto_play: Option<bool>,
        #[serde(default)]
        muted: Option<bool>,
    },
    /// The flip animation to `page_index` has completed.
    PageFlipped { page_index: usize },
    /// Every image from the last `preload_images` has decoded.
    ImagesReady,
    ToggleLanguage,
    ToggleMute,
    ToggleAutoPlay,
    SetVoiceGender { voice_gender: VoiceGender },
    Restart,
    ToggleMenu,
    CloseMenu,
    Back,
    Retry,
    /// A `play_audio`/`play_speech` clip reached its end.
    AudioEnded { playback_id: u64 },
    /// A `play_audio`/`play_speech` clip could not be played.
    AudioFailed {
        playback_id: u64,
        #[serde(default)]
        message: Option<String>,
    },
    /// Opens the assistant, resuming `conversation_id` when given.
    OpenChat {
        #[serde(default)]
        conversation_id: Option<Uuid>,
        #[serde(default)]
        language: Option<Language>,
    },
    SendChat { text: String },
    /// Cancels the assistant's reply in flight.
    StopChat,
    StartListening,
    StopListening,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (App)
//=========================================================================================
// NOTE: Synthesized speech is sent as a raw Binary frame right after the
// `play_speech`/`queue_speech` message that announces it.
//=========================================================================================

/// What the reading screen renders.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StoryView {
    pub story_id: Uuid,
    /// Dotted state name, e.g. `ready.playingAudio`.
    pub state: String,
    pub error: Option<String>,
    pub retryable: bool,
    pub current_page_index: usize,
    pub page_count: usize,
    pub language: Language,
    pub voice_gender: VoiceGender,
    pub auto_play: bool,
    pub muted: bool,
    pub menu_visible: bool,
    pub image_urls: Vec<String>,
}

impl StoryView {
    pub fn new(story_id: Uuid, snapshot: &StorySnapshot) -> Self {
        let (error, retryable) = match &snapshot.state {
            StoryState::Error { message, retryable } => (Some(message.clone()), *retryable),
            _ => (None, false),
        };
        Self {
            story_id,
            state: snapshot.state.tag().to_string(),
            error,
            retryable,
            current_page_index: snapshot.current_page_index,
            page_count: snapshot.page_count,
            language: snapshot.language,
            voice_gender: snapshot.voice_gender,
            auto_play: snapshot.auto_play,
            muted: snapshot.muted,
            menu_visible: snapshot.menu_visible,
            image_urls: snapshot.image_urls.clone(),
        }
    }
}

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StoryState(StoryView),
    /// Animate the book to `page_index`; answer with `page_flipped`.
    TurnPage { page_index: usize },
    /// Decode these images; answer with `images_ready`.
    PreloadImages { urls: Vec<String> },
    /// Play recorded narration; answer with `audio_ended` or `audio_failed`.
    PlayAudio { playback_id: u64, url: String },
    /// Play the binary frame that follows; answer with `audio_ended` or `audio_failed`.
    PlaySpeech { playback_id: u64 },
    /// Queue the binary frame that follows behind any speech already queued.
    QueueSpeech { text: String },
    /// Stop everything playing and drop queued speech.
    StopAudio,
    ChatOpened { conversation_id: Uuid },
    ChatStatus { status: ChatStatus },
    /// The assistant's reply so far.
    ChatTranscript { text: String },
    /// The assistant asked to open a story.
    Navigate { story_id: Uuid },
    /// Text heard through the microphone.
    Recognized { text: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let id = Uuid::new_v4();
        let open: ClientMessage = serde_json::from_value(json!({
            "type": "open_story", "story_id": id, "language": "en"
        }))
        .unwrap();
        assert_eq!(
            open,
            ClientMessage::OpenStory {
                story_id: id,
                language: Some(Language::En),
                voice_gender: None,
                auto_play: None,
                muted: None,
            }
        );

        let gender: ClientMessage =
            serde_json::from_str(r#"{"type":"set_voice_gender","voice_gender":"male"}"#).unwrap();
        assert_eq!(gender, ClientMessage::SetVoiceGender { voice_gender: VoiceGender::Male });

        let ended: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_ended","playback_id":7}"#).unwrap();
        assert_eq!(ended, ClientMessage::AudioEnded { playback_id: 7 });

        let chat: ClientMessage = serde_json::from_str(r#"{"type":"open_chat"}"#).unwrap();
        assert_eq!(chat, ClientMessage::OpenChat { conversation_id: None, language: None });
    }

    #[test]
    fn unknown_client_messages_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch_rocket"}"#).is_err());
    }

    #[test]
    fn server_messages_flatten_their_payloads() {
        let value = serde_json::to_value(ServerMessage::PlayAudio {
            playback_id: 3,
            url: "https://cdn.example/0.mp3".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "play_audio", "playback_id": 3, "url": "https://cdn.example/0.mp3" })
        );

        let status = serde_json::to_value(ServerMessage::ChatStatus { status: ChatStatus::Streaming }).unwrap();
        assert_eq!(status, json!({ "type": "chat_status", "status": "streaming" }));
    }

    #[test]
    fn story_view_reports_errors() {
        let snapshot = StorySnapshot {
            state: StoryState::Error {
                message: "offline".to_string(),
                retryable: true,
            },
            current_page_index: 0,
            page_count: 0,
            language: Language::Vi,
            voice_gender: VoiceGender::Female,
            auto_play: true,
            muted: false,
            menu_visible: false,
            image_urls: Vec::new(),
        };
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ServerMessage::StoryState(StoryView::new(id, &snapshot))).unwrap();
        assert_eq!(value["type"], "story_state");
        assert_eq!(value["state"], "error");
        assert_eq!(value["error"], "offline");
        assert_eq!(value["retryable"], true);
        assert_eq!(value["story_id"], json!(id));
    }
}

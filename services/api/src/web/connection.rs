//! services/api/src/web/connection.rs
//!
//! The state of one WebSocket connection: at most one open story, at most one
//! open chat, and the microphone guard. Client messages are applied here in
//! the order they arrive.

use ecokids_core::chat::{
    ChatConfig, ChatPorts, ChatSession, ChatStatus, OpenStoryTool, StorySearchTool, TurnOutcome,
};
use ecokids_core::domain::Language;
use ecokids_core::ports::ChatTool;
use ecokids_core::story::{
    StoryEvent, StoryHandle, StoryOptions, StoryPorts, StoryReadSession, StoryState,
};
use ecokids_core::voice::VoiceInput;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::web::client::{ClientBook, ClientLink, ClientMicrophone, ClientNavigator, ClientSpeaker};
use crate::web::protocol::{ClientMessage, ServerMessage, StoryView};
use crate::web::state::AppState;

/// Mirrors every value of `rx` to the app until the channel closes or the app leaves.
fn forward<T, F>(mut rx: watch::Receiver<T>, link: ClientLink, to_message: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> ServerMessage + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let message = to_message(&rx.borrow_and_update());
            if !link.send(message) {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

struct OpenStory {
    story_id: Uuid,
    handle: StoryHandle,
    session: JoinHandle<StoryState>,
}

pub struct Connection {
    app: Arc<AppState>,
    user_id: Option<Uuid>,
    link: ClientLink,
    speaker: Arc<ClientSpeaker>,
    book: Arc<ClientBook>,
    voice: Arc<VoiceInput>,
    microphone: Arc<ClientMicrophone>,
    story: Option<OpenStory>,
    chat: Option<Arc<ChatSession>>,
}

impl Connection {
    pub fn new(app: Arc<AppState>, user_id: Option<Uuid>, link: ClientLink) -> Self {
        let speaker = ClientSpeaker::new(link.clone(), app.tts_adapter.clone());
        let book = ClientBook::new(link.clone());
        let microphone = ClientMicrophone::new(app.sst_adapter.clone());
        let voice = Arc::new(VoiceInput::new(microphone.clone()));
        Self {
            app,
            user_id,
            link,
            speaker,
            book,
            voice,
            microphone,
            story: None,
            chat: None,
        }
    }

    /// Applies one message from the app.
    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::OpenStory {
                story_id,
                language,
                voice_gender,
                auto_play,
                muted,
            } => {
                let defaults = StoryOptions::default();
                let options = StoryOptions {
                    language: language.unwrap_or(defaults.language),
                    voice_gender: voice_gender.unwrap_or(defaults.voice_gender),
                    auto_play: auto_play.unwrap_or(defaults.auto_play),
                    muted: muted.unwrap_or(defaults.muted),
                };
                self.open_story(story_id, options);
            }
            ClientMessage::PageFlipped { page_index } => {
                self.with_story(|story| story.handle.page_flipped(page_index))
            }
            ClientMessage::ToggleAutoPlay => self.with_story(|story| {
                let enabled = story.handle.toggle_auto_play();
                info!(story_id = %story.story_id, enabled, "Autoplay toggled.");
                true
            }),
            ClientMessage::ToggleLanguage => self.story_event(StoryEvent::ToggleLanguage),
            ClientMessage::ToggleMute => self.story_event(StoryEvent::ToggleMute),
            ClientMessage::SetVoiceGender { voice_gender } => {
                self.story_event(StoryEvent::SetVoiceGender(voice_gender))
            }
            ClientMessage::Restart => self.story_event(StoryEvent::Restart),
            ClientMessage::ToggleMenu => self.story_event(StoryEvent::ToggleMenu),
            ClientMessage::CloseMenu => self.story_event(StoryEvent::CloseMenu),
            ClientMessage::Retry => self.story_event(StoryEvent::Retry),
            ClientMessage::Back => self.close_story(),
            ClientMessage::ImagesReady => self.book.images_ready(),
            ClientMessage::AudioEnded { playback_id } => self.speaker.finished(playback_id),
            ClientMessage::AudioFailed {
                playback_id,
                message,
            } => self.speaker.failed(playback_id, message),
            ClientMessage::OpenChat {
                conversation_id,
                language,
            } => self.open_chat(conversation_id, language).await,
            ClientMessage::SendChat { text } => match &self.chat {
                Some(chat) => self.spawn_turn(chat.clone(), text),
                None => self.report("Open the assistant before sending a message."),
            },
            ClientMessage::StopChat => {
                if let Some(chat) = &self.chat {
                    chat.cancel().await;
                }
            }
            ClientMessage::StartListening => {
                let status = self.chat.as_ref().map_or(ChatStatus::Ready, |c| c.status());
                if !self.voice.start(self.locale(), status).await {
                    info!(?status, "Listening request ignored.");
                }
            }
            ClientMessage::StopListening => self.finish_listening(),
        }
    }

    /// Microphone audio from a binary frame.
    pub fn push_audio(&self, data: &[u8]) {
        self.microphone.push_audio(data);
    }

    /// Reports a problem to the app without ending anything.
    pub fn report(&self, message: &str) {
        self.link.send(ServerMessage::Error {
            message: message.to_string(),
        });
    }

    /// Ends the story and cancels the assistant when the app goes away.
    pub async fn close(&mut self) {
        self.close_story();
        if let Some(chat) = self.chat.take() {
            chat.cancel().await;
        }
    }

    fn locale(&self) -> &'static str {
        let language = match (&self.chat, &self.story) {
            (Some(chat), _) => chat.language(),
            (None, Some(story)) => story.handle.snapshot().language,
            (None, None) => Language::Vi,
        };
        language.locale()
    }

    //=====================================================================================
    // Story
    //=====================================================================================

    fn open_story(&mut self, story_id: Uuid, options: StoryOptions) {
        self.close_story();
        info!(%story_id, user_id = ?self.user_id, "Opening story.");

        let ports = StoryPorts {
            segments: self.app.segments.clone(),
            views: self.app.views.clone(),
            progress: self.app.progress.clone(),
            resume: self.app.resume.clone(),
            images: self.book.clone(),
            audio: self.speaker.clone(),
            pages: self.book.clone(),
        };
        let (handle, session) = StoryReadSession::spawn(ports, story_id, self.user_id, options);
        forward(handle.subscribe(), self.link.clone(), move |snapshot| {
            ServerMessage::StoryState(StoryView::new(story_id, snapshot))
        });
        self.story = Some(OpenStory {
            story_id,
            handle,
            session,
        });
    }

    fn close_story(&mut self) {
        if let Some(story) = self.story.take() {
            story.handle.send(StoryEvent::Back);
            let story_id = story.story_id;
            tokio::spawn(async move {
                match story.session.await {
                    Ok(state) => info!(%story_id, final_state = state.tag(), "Story closed."),
                    Err(e) => error!(%story_id, "Story session panicked: {}", e),
                }
            });
        }
    }

    fn with_story(&self, apply: impl FnOnce(&OpenStory) -> bool) {
        match &self.story {
            Some(story) => {
                if !apply(story) {
                    warn!(story_id = %story.story_id, "Story session already ended.");
                }
            }
            None => warn!("No story is open on this connection."),
        }
    }

    fn story_event(&self, event: StoryEvent) {
        self.with_story(|story| story.handle.send(event));
    }

    //=====================================================================================
    // Chat
    //=====================================================================================

    async fn open_chat(&mut self, conversation_id: Option<Uuid>, language: Option<Language>) {
        if let Some(previous) = self.chat.take() {
            previous.cancel().await;
        }

        let navigator = Arc::new(ClientNavigator::new(self.link.clone()));
        let tools: Vec<Arc<dyn ChatTool>> = vec![
            Arc::new(StorySearchTool::new(
                self.app.search.clone(),
                self.app.config.story_search_limit,
            )),
            Arc::new(OpenStoryTool::new(navigator)),
        ];
        let config = ChatConfig {
            system_prompt: self.app.system_prompt.clone(),
            language: language.unwrap_or(Language::Vi),
            tools,
        };
        let ports = ChatPorts {
            model: self.app.model.clone(),
            log: self.app.conversations.clone(),
            tts: self.speaker.clone(),
        };

        match ChatSession::open(ports, self.user_id, conversation_id, config).await {
            Ok(session) => {
                let session = Arc::new(session);
                self.link.send(ServerMessage::ChatOpened {
                    conversation_id: session.conversation_id(),
                });
                forward(session.subscribe_status(), self.link.clone(), |status| {
                    ServerMessage::ChatStatus { status: *status }
                });
                forward(session.subscribe_transcript(), self.link.clone(), |text| {
                    ServerMessage::ChatTranscript { text: text.clone() }
                });
                self.chat = Some(session);
            }
            Err(e) => {
                error!("Failed to open the assistant: {}", e);
                self.report("The assistant is unavailable right now.");
            }
        }
    }

    fn spawn_turn(&self, chat: Arc<ChatSession>, text: String) {
        let link = self.link.clone();
        tokio::spawn(async move {
            if let TurnOutcome::Failed(e) = chat.send(&text).await {
                link.send(ServerMessage::Error {
                    message: format!("The assistant could not answer: {}", e),
                });
            }
        });
    }

    fn finish_listening(&self) {
        let voice = self.voice.clone();
        let chat = self.chat.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            let Some(text) = voice.stop().await else {
                return;
            };
            link.send(ServerMessage::Recognized { text: text.clone() });
            if let Some(chat) = chat {
                if let TurnOutcome::Failed(e) = chat.send(&text).await {
                    link.send(ServerMessage::Error {
                        message: format!("The assistant could not answer: {}", e),
                    });
                }
            }
        });
    }
}

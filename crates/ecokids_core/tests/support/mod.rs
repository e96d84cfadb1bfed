//! In-memory fakes of every port, shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ecokids_core::domain::{
    AudioVariant, ChatConversation, ChatMessage, Language, MessageRole, ModelMessage, StorySegment,
    VoiceGender,
};
use ecokids_core::ports::{
    AudioPlayer, ChatRequest, ConversationLog, ImagePreloader, ModelClient, ModelStream,
    PageTurner, PlaybackEnd, PortError, PortResult, ProgressLogger, ResumeStore, SegmentStore,
    StreamEvent, TtsQueue, ViewCounter,
};
use ecokids_core::story::{StoryHandle, StoryPorts};
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//=========================================================================================
// Story fakes
//=========================================================================================

/// Three pages; the first two have female Vietnamese narration.
pub fn three_segments(story_id: Uuid) -> Vec<StorySegment> {
    (0..3u32)
        .map(|index| StorySegment {
            id: Uuid::new_v4(),
            story_id,
            index,
            text_by_language: HashMap::from([
                (Language::Vi, format!("Trang {index}.")),
                (Language::En, format!("Page {index}.")),
            ]),
            image_url: Some(format!("https://cdn.example/{index}.png")),
            audio_variants: if index < 2 {
                vec![AudioVariant {
                    language: Language::Vi,
                    gender: VoiceGender::Female,
                    audio_url: format!("https://cdn.example/{index}-vi-female.mp3"),
                }]
            } else {
                Vec::new()
            },
        })
        .collect()
}

#[derive(Default)]
pub struct FakeSegments {
    responses: Mutex<VecDeque<PortResult<Vec<StorySegment>>>>,
    pub calls: AtomicUsize,
}

impl FakeSegments {
    pub fn with(responses: Vec<PortResult<Vec<StorySegment>>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SegmentStore for FakeSegments {
    async fn fetch_segments(&self, story_id: Uuid) -> PortResult<Vec<StorySegment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PortError::NotFound(story_id.to_string())))
    }
}

#[derive(Default)]
pub struct FakeViews {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ViewCounter for FakeViews {
    async fn increment_view_count(&self, _story_id: Uuid) -> PortResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PortError::Unexpected("views offline".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProgress {
    pub fail: bool,
    pub logged: Mutex<Vec<(Uuid, Uuid, Uuid)>>,
}

#[async_trait]
impl ProgressLogger for FakeProgress {
    async fn log_progress(&self, story_id: Uuid, segment_id: Uuid, user_id: Uuid) -> PortResult<()> {
        self.logged.lock().unwrap().push((story_id, segment_id, user_id));
        if self.fail {
            return Err(PortError::Unexpected("progress offline".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeResume {
    pub marked: Mutex<Vec<(Option<Uuid>, Uuid, usize)>>,
}

#[async_trait]
impl ResumeStore for FakeResume {
    async fn mark_resumable(&self, user_id: Option<Uuid>, story_id: Uuid, page_index: usize) -> PortResult<()> {
        self.marked.lock().unwrap().push((user_id, story_id, page_index));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeImages {
    pub preloaded: Mutex<Vec<String>>,
}

#[async_trait]
impl ImagePreloader for FakeImages {
    async fn preload(&self, urls: &[String]) -> PortResult<()> {
        self.preloaded.lock().unwrap().extend_from_slice(urls);
        Ok(())
    }
}

/// Records what was played. In manual mode playback only ends when the test says so.
#[derive(Default)]
pub struct FakeAudio {
    pub manual: bool,
    pub played: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    pending: Mutex<Vec<oneshot::Sender<PlaybackEnd>>>,
}

impl FakeAudio {
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn playing(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Completes every playback in progress.
    pub fn finish_all(&self) {
        for tx in self.pending.lock().unwrap().drain(..) {
            let _ = tx.send(PlaybackEnd::Finished);
        }
    }

    async fn run(&self, label: String) -> PortResult<PlaybackEnd> {
        self.played.lock().unwrap().push(label);
        if !self.manual {
            return Ok(PlaybackEnd::Finished);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().push(tx);
        Ok(rx.await.unwrap_or(PlaybackEnd::Stopped))
    }
}

#[async_trait]
impl AudioPlayer for FakeAudio {
    async fn play(&self, url: &str) -> PortResult<PlaybackEnd> {
        self.run(url.to_string()).await
    }

    async fn synthesize_and_play(
        &self,
        text: &str,
        gender: VoiceGender,
        language: Language,
    ) -> PortResult<PlaybackEnd> {
        self.run(format!("tts:{}:{}:{}", language.code(), gender.code(), text))
            .await
    }

    async fn stop_all(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        for tx in self.pending.lock().unwrap().drain(..) {
            let _ = tx.send(PlaybackEnd::Stopped);
        }
    }
}

/// A page-flipper that, once linked, reports every turn back as a flip.
#[derive(Default)]
pub struct FakePages {
    pub turns: Mutex<Vec<usize>>,
    link: OnceLock<StoryHandle>,
}

impl FakePages {
    pub fn link(&self, handle: StoryHandle) {
        let _ = self.link.set(handle);
    }

    pub fn turns(&self) -> Vec<usize> {
        self.turns.lock().unwrap().clone()
    }
}

impl PageTurner for FakePages {
    fn turn_to(&self, page_index: usize) {
        self.turns.lock().unwrap().push(page_index);
        if let Some(handle) = self.link.get() {
            handle.page_flipped(page_index);
        }
    }
}

pub struct StoryFakes {
    pub segments: Arc<FakeSegments>,
    pub views: Arc<FakeViews>,
    pub progress: Arc<FakeProgress>,
    pub resume: Arc<FakeResume>,
    pub images: Arc<FakeImages>,
    pub audio: Arc<FakeAudio>,
    pub pages: Arc<FakePages>,
}

impl StoryFakes {
    pub fn new(segments: FakeSegments, audio: FakeAudio) -> Self {
        Self {
            segments: Arc::new(segments),
            views: Arc::new(FakeViews::default()),
            progress: Arc::new(FakeProgress::default()),
            resume: Arc::new(FakeResume::default()),
            images: Arc::new(FakeImages::default()),
            audio: Arc::new(audio),
            pages: Arc::new(FakePages::default()),
        }
    }

    pub fn ports(&self) -> StoryPorts {
        StoryPorts {
            segments: self.segments.clone(),
            views: self.views.clone(),
            progress: self.progress.clone(),
            resume: self.resume.clone(),
            images: self.images.clone(),
            audio: self.audio.clone(),
            pages: self.pages.clone(),
        }
    }
}

//=========================================================================================
// Chat fakes
//=========================================================================================

#[derive(Default)]
pub struct MemoryLog {
    pub messages: Mutex<Vec<ChatMessage>>,
    pub conversations: Mutex<Vec<ChatConversation>>,
    pub fail_appends: bool,
    /// When set, assistant appends wait for a permit.
    pub assistant_gate: Option<Arc<Semaphore>>,
    pub held_appends: AtomicUsize,
}

impl MemoryLog {
    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| format!("{}:{}", m.role.as_str(), m.text_content))
            .collect()
    }
}

#[async_trait]
impl ConversationLog for MemoryLog {
    async fn create_conversation(
        &self,
        user_id: Option<Uuid>,
        title: Option<&str>,
    ) -> PortResult<ChatConversation> {
        let now = Utc::now();
        let conversation = ChatConversation {
            id: Uuid::new_v4(),
            user_id,
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.conversations.lock().unwrap().push(conversation.clone());
        Ok(conversation)
    }

    async fn append(&self, message: &ChatMessage) -> PortResult<()> {
        if self.fail_appends {
            return Err(PortError::Unexpected("database offline".into()));
        }
        if let (Some(gate), MessageRole::Assistant) = (&self.assistant_gate, message.role) {
            self.held_appends.fetch_add(1, Ordering::SeqCst);
            gate.acquire().await.unwrap().forget();
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn list_ordered(&self, conversation_id: Uuid) -> PortResult<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

#[derive(Default)]
pub struct RecordingTts {
    pub fail: bool,
    pub queued: Mutex<Vec<(String, String)>>,
    pub clears: AtomicUsize,
}

impl RecordingTts {
    pub fn sentences(&self) -> Vec<String> {
        self.queued.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }
}

#[async_trait]
impl TtsQueue for RecordingTts {
    async fn enqueue(&self, text: &str, locale: &str) -> PortResult<()> {
        self.queued.lock().unwrap().push((text.to_string(), locale.to_string()));
        if self.fail {
            return Err(PortError::Unexpected("speaker busy".into()));
        }
        Ok(())
    }

    async fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// One step of a scripted model reply.
pub enum Step {
    Delta(&'static str),
    Finish(Vec<ModelMessage>),
    Fail(PortError),
    /// Never finish; only cancellation ends the turn.
    Hang,
}

/// Replays one script per `stream_chat` call and records the requests it saw.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub requests: Mutex<Vec<(usize, String)>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        _abort: CancellationToken,
    ) -> PortResult<ModelStream> {
        self.requests
            .lock()
            .unwrap()
            .push((request.history.len(), request.message.clone()));
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        let mut items = Vec::new();
        let mut hang = false;
        for step in script {
            match step {
                Step::Delta(text) => items.push(Ok(StreamEvent::TextDelta(text.to_string()))),
                Step::Finish(messages) => items.push(Ok(StreamEvent::Finished { messages })),
                Step::Fail(e) => items.push(Err(e)),
                Step::Hang => hang = true,
            }
        }
        let replay = stream::iter(items);
        if hang {
            use futures::StreamExt;
            Ok(Box::pin(replay.chain(stream::pending())))
        } else {
            Ok(Box::pin(replay))
        }
    }
}

pub fn assistant(text: &str) -> ModelMessage {
    ModelMessage {
        role: ecokids_core::domain::MessageRole::Assistant,
        raw_content: serde_json::json!({ "role": "assistant", "content": text }),
    }
}

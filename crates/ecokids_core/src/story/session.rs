//! crates/ecokids_core/src/story/session.rs
//!
//! The asynchronous interpreter for the story reading state machine.
//!
//! A `StoryReadSession` owns the state and context of one reading attempt and
//! runs as a single task. UI code talks to it through cloneable `StoryHandle`s;
//! port calls run as spawned tasks that report back on an internal channel, so
//! events are always applied one at a time.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{Language, VoiceGender};
use crate::ports::{
    AudioPlayer, ImagePreloader, PageTurner, PlaybackEnd, ProgressLogger, ResumeStore,
    SegmentStore, ViewCounter,
};
use crate::story::machine::{
    transition, AudioSource, AutoPlayFlag, Effect, StoryContext, StoryEvent, StoryState,
};

/// The collaborators a reading session drives.
#[derive(Clone)]
pub struct StoryPorts {
    pub segments: Arc<dyn SegmentStore>,
    pub views: Arc<dyn ViewCounter>,
    pub progress: Arc<dyn ProgressLogger>,
    pub resume: Arc<dyn ResumeStore>,
    pub images: Arc<dyn ImagePreloader>,
    pub audio: Arc<dyn AudioPlayer>,
    pub pages: Arc<dyn PageTurner>,
}

/// Reading preferences a session starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoryOptions {
    pub language: Language,
    pub voice_gender: VoiceGender,
    pub auto_play: bool,
    pub muted: bool,
}

impl Default for StoryOptions {
    fn default() -> Self {
        Self {
            language: Language::Vi,
            voice_gender: VoiceGender::Female,
            auto_play: true,
            muted: false,
        }
    }
}

/// What the screen renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorySnapshot {
    pub state: StoryState,
    pub current_page_index: usize,
    pub page_count: usize,
    pub language: Language,
    pub voice_gender: VoiceGender,
    pub auto_play: bool,
    pub muted: bool,
    pub menu_visible: bool,
    pub image_urls: Vec<String>,
}

impl StorySnapshot {
    fn capture(state: &StoryState, ctx: &StoryContext) -> Self {
        Self {
            state: state.clone(),
            current_page_index: ctx.current_page_index,
            page_count: ctx.segments.len(),
            language: ctx.language,
            voice_gender: ctx.voice_gender,
            auto_play: ctx.auto_play.get(),
            muted: ctx.muted,
            menu_visible: ctx.menu_visible,
            image_urls: ctx.image_urls.clone(),
        }
    }
}

//=========================================================================================
// StoryHandle
//=========================================================================================

/// A cloneable remote control for a running session.
///
/// The session ends on its own once every handle has been dropped.
#[derive(Clone)]
pub struct StoryHandle {
    events: mpsc::UnboundedSender<StoryEvent>,
    auto_play: AutoPlayFlag,
    snapshots: watch::Receiver<StorySnapshot>,
}

impl StoryHandle {
    /// Queues an event. Returns `false` once the session has ended.
    pub fn send(&self, event: StoryEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn page_flipped(&self, page_index: usize) -> bool {
        self.send(StoryEvent::PageFlipped(page_index))
    }

    /// Flips autoplay immediately, so audio already playing observes the new value.
    pub fn toggle_auto_play(&self) -> bool {
        let enabled = self.auto_play.toggle();
        self.send(StoryEvent::AutoPlayChanged);
        enabled
    }

    pub fn snapshot(&self) -> StorySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StorySnapshot> {
        self.snapshots.clone()
    }
}

//=========================================================================================
// StoryReadSession
//=========================================================================================

pub struct StoryReadSession {
    state: StoryState,
    ctx: StoryContext,
    ports: StoryPorts,
    external: mpsc::UnboundedReceiver<StoryEvent>,
    internal_tx: mpsc::UnboundedSender<StoryEvent>,
    internal_rx: mpsc::UnboundedReceiver<StoryEvent>,
    snapshots: watch::Sender<StorySnapshot>,
    playback_task: Option<JoinHandle<()>>,
}

impl StoryReadSession {
    pub fn new(
        ports: StoryPorts,
        story_id: Uuid,
        user_id: Option<Uuid>,
        options: StoryOptions,
    ) -> (Self, StoryHandle) {
        let auto_play = AutoPlayFlag::new(options.auto_play);
        let ctx = StoryContext::new(
            story_id,
            user_id,
            options.language,
            options.voice_gender,
            auto_play.clone(),
            options.muted,
        );
        let state = StoryState::initial();
        let (events_tx, external) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = watch::channel(StorySnapshot::capture(&state, &ctx));

        let session = Self {
            state,
            ctx,
            ports,
            external,
            internal_tx,
            internal_rx,
            snapshots,
            playback_task: None,
        };
        let handle = StoryHandle {
            events: events_tx,
            auto_play,
            snapshots: snapshots_rx,
        };
        (session, handle)
    }

    /// Creates a session and runs it on the current runtime.
    pub fn spawn(
        ports: StoryPorts,
        story_id: Uuid,
        user_id: Option<Uuid>,
        options: StoryOptions,
    ) -> (StoryHandle, JoinHandle<StoryState>) {
        let (session, handle) = Self::new(ports, story_id, user_id, options);
        (handle, tokio::spawn(session.run()))
    }

    /// Processes events until the session finishes. Returns the final state.
    pub async fn run(mut self) -> StoryState {
        info!(story_id = %self.ctx.story_id, "Story reading session started.");
        self.run_effects(vec![Effect::FetchSegments]).await;

        while !self.state.is_final() {
            let event = tokio::select! {
                biased;
                Some(event) = self.internal_rx.recv() => event,
                event = self.external.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("All story handles dropped; closing the session.");
                        StoryEvent::Back
                    }
                },
            };
            self.dispatch(event).await;
        }

        info!(story_id = %self.ctx.story_id, "Story reading session finished.");
        self.state
    }

    async fn dispatch(&mut self, event: StoryEvent) {
        let (next, effects) = transition(&self.state, &mut self.ctx, event);
        if next != self.state {
            debug!(from = self.state.tag(), to = next.tag(), "Story state changed.");
        }
        if let StoryState::Error { message, .. } = &next {
            error!(story_id = %self.ctx.story_id, "Failed to load story: {}", message);
        }
        self.state = next;
        self.run_effects(effects).await;
        self.snapshots
            .send_replace(StorySnapshot::capture(&self.state, &self.ctx));
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::FetchSegments => {
                    let store = self.ports.segments.clone();
                    let story_id = self.ctx.story_id;
                    self.report(async move {
                        match store.fetch_segments(story_id).await {
                            Ok(segments) => StoryEvent::SegmentsLoaded(segments),
                            Err(e) => StoryEvent::SegmentsFailed(e),
                        }
                    });
                }
                Effect::IncrementViewCount => {
                    let views = self.ports.views.clone();
                    let story_id = self.ctx.story_id;
                    self.report(async move {
                        if let Err(e) = views.increment_view_count(story_id).await {
                            warn!(%story_id, "Failed to increment view count: {}", e);
                        }
                        StoryEvent::ViewCountSettled
                    });
                }
                Effect::PreloadImages(urls) => {
                    let images = self.ports.images.clone();
                    self.report(async move {
                        if let Err(e) = images.preload(&urls).await {
                            warn!("Image preload failed, showing pages anyway: {}", e);
                        }
                        StoryEvent::ImagesReady
                    });
                }
                Effect::LogProgress {
                    page_index,
                    segment_id,
                    user_id,
                } => {
                    let progress = self.ports.progress.clone();
                    let story_id = self.ctx.story_id;
                    self.report(async move {
                        if let Err(e) = progress.log_progress(story_id, segment_id, user_id).await {
                            warn!(%story_id, page_index, "Failed to log reading progress: {}", e);
                        }
                        StoryEvent::ProgressLogged { page_index }
                    });
                }
                Effect::MarkResumable { page_index } => {
                    let resume = self.ports.resume.clone();
                    let (story_id, user_id) = (self.ctx.story_id, self.ctx.user_id);
                    tokio::spawn(async move {
                        if let Err(e) = resume.mark_resumable(user_id, story_id, page_index).await {
                            warn!(%story_id, page_index, "Failed to save resume point: {}", e);
                        }
                    });
                }
                Effect::StopAudio => self.stop_audio().await,
                Effect::Play { playback, source } => {
                    self.stop_audio().await;
                    self.start_audio(playback, source);
                }
                Effect::TurnPage(page_index) => {
                    debug!(page_index, "Turning page.");
                    self.ports.pages.turn_to(page_index);
                }
            }
        }
    }

    /// Runs `task` in the background and feeds its resulting event back in.
    fn report<F>(&self, task: F)
    where
        F: std::future::Future<Output = StoryEvent> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
    }

    async fn stop_audio(&mut self) {
        self.ports.audio.stop_all().await;
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
    }

    fn start_audio(&mut self, playback: u64, source: AudioSource) {
        let audio = self.ports.audio.clone();
        let tx = self.internal_tx.clone();
        let page_index = self.ctx.current_page_index;
        self.playback_task = Some(tokio::spawn(async move {
            let result = match &source {
                AudioSource::Url(url) => audio.play(url).await,
                AudioSource::Speech {
                    text,
                    gender,
                    language,
                } => audio.synthesize_and_play(text, *gender, *language).await,
            };
            let event = match result {
                Ok(PlaybackEnd::Finished) => StoryEvent::AudioFinished { playback },
                Ok(PlaybackEnd::Stopped) => {
                    debug!(page_index, "Playback stopped before the end.");
                    StoryEvent::AudioStopped { playback }
                }
                Err(e) => {
                    warn!(page_index, "Playback failed: {}", e);
                    StoryEvent::AudioFailed { playback }
                }
            };
            let _ = tx.send(event);
        }));
    }
}

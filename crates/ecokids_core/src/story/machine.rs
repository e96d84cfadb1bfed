//! crates/ecokids_core/src/story/machine.rs
//!
//! The story reading state machine as a pure reducer.
//!
//! `transition` takes the current state, the session context and one event, and
//! returns the next state plus the side effects the interpreter must run. No I/O
//! happens here; the only shared cell is the autoplay flag, which is written by
//! UI handles and read when audio finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Language, StorySegment, VoiceGender};
use crate::ports::PortError;

//=========================================================================================
// States
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingStep {
    FetchingSegments,
    IncrementingViewCount,
    PreloadingImages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStep {
    Idle,
    /// Transient: resolved within the same transition.
    PageFlipped,
    LoggingProgress,
    /// Transient: resolved within the same transition.
    CheckingAutoPlay,
    PlayingAudio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoryState {
    Loading(LoadingStep),
    Ready(ReadyStep),
    Error { message: String, retryable: bool },
    Finished,
}

impl StoryState {
    pub fn initial() -> Self {
        StoryState::Loading(LoadingStep::FetchingSegments)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, StoryState::Finished)
    }

    /// Dotted name of the state, e.g. `ready.playingAudio`.
    pub fn tag(&self) -> &'static str {
        match self {
            StoryState::Loading(LoadingStep::FetchingSegments) => "loading.fetchingSegments",
            StoryState::Loading(LoadingStep::IncrementingViewCount) => "loading.incrementingViewCount",
            StoryState::Loading(LoadingStep::PreloadingImages) => "loading.preloadingImages",
            StoryState::Ready(ReadyStep::Idle) => "ready.idle",
            StoryState::Ready(ReadyStep::PageFlipped) => "ready.pageFlipped",
            StoryState::Ready(ReadyStep::LoggingProgress) => "ready.loggingProgress",
            StoryState::Ready(ReadyStep::CheckingAutoPlay) => "ready.checkingAutoPlay",
            StoryState::Ready(ReadyStep::PlayingAudio) => "ready.playingAudio",
            StoryState::Error { .. } => "error",
            StoryState::Finished => "finished",
        }
    }
}

//=========================================================================================
// Autoplay Cell
//=========================================================================================

/// The autoplay preference, shared between UI handles and the session.
///
/// Audio completion reads this at completion time, so a toggle made while a page
/// is playing governs whether that page advances.
#[derive(Debug, Clone, Default)]
pub struct AutoPlayFlag(Arc<AtomicBool>);

impl AutoPlayFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    /// Flips the flag and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

//=========================================================================================
// Context, Events and Effects
//=========================================================================================

/// What to play for the current page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Url(String),
    Speech {
        text: String,
        gender: VoiceGender,
        language: Language,
    },
}

#[derive(Debug, Clone)]
pub struct StoryContext {
    pub story_id: Uuid,
    pub user_id: Option<Uuid>,
    pub segments: Vec<StorySegment>,
    pub current_page_index: usize,
    pub language: Language,
    pub voice_gender: VoiceGender,
    pub auto_play: AutoPlayFlag,
    pub muted: bool,
    pub menu_visible: bool,
    pub image_urls: Vec<String>,
    /// Pre-rendered narration per page for the current language and voice.
    pub audio_urls: Vec<Option<String>>,
    /// Generation of the most recent playback; older completions are ignored.
    pub playback: u64,
}

impl StoryContext {
    pub fn new(
        story_id: Uuid,
        user_id: Option<Uuid>,
        language: Language,
        voice_gender: VoiceGender,
        auto_play: AutoPlayFlag,
        muted: bool,
    ) -> Self {
        Self {
            story_id,
            user_id,
            segments: Vec::new(),
            current_page_index: 0,
            language,
            voice_gender,
            auto_play,
            muted,
            menu_visible: false,
            image_urls: Vec::new(),
            audio_urls: Vec::new(),
            playback: 0,
        }
    }

    pub fn has_next_page(&self) -> bool {
        self.current_page_index + 1 < self.segments.len()
    }

    pub fn should_play_audio(&self) -> bool {
        !self.muted
    }

    pub fn current_source(&self) -> Option<AudioSource> {
        let index = self.current_page_index;
        if let Some(Some(url)) = self.audio_urls.get(index) {
            return Some(AudioSource::Url(url.clone()));
        }
        let text = self.segments.get(index)?.text(self.language)?;
        Some(AudioSource::Speech {
            text: text.to_string(),
            gender: self.voice_gender,
            language: self.language,
        })
    }

    fn load_segments(&mut self, mut segments: Vec<StorySegment>) {
        segments.sort_by_key(|s| s.index);
        self.image_urls = segments.iter().filter_map(|s| s.image_url.clone()).collect();
        self.segments = segments;
        self.current_page_index = 0;
        self.recompute_audio_urls();
    }

    fn recompute_audio_urls(&mut self) {
        self.audio_urls = self
            .segments
            .iter()
            .map(|s| s.audio_url(self.language, self.voice_gender).map(str::to_string))
            .collect();
    }
}

#[derive(Debug, Clone)]
pub enum StoryEvent {
    SegmentsLoaded(Vec<StorySegment>),
    SegmentsFailed(PortError),
    ViewCountSettled,
    ImagesReady,
    PageFlipped(usize),
    ProgressLogged { page_index: usize },
    AudioFinished { playback: u64 },
    AudioFailed { playback: u64 },
    /// Another consumer of the speaker stopped this playback.
    AudioStopped { playback: u64 },
    ToggleLanguage,
    ToggleMute,
    /// The autoplay cell was already flipped by the sender.
    AutoPlayChanged,
    SetVoiceGender(VoiceGender),
    Restart,
    ToggleMenu,
    CloseMenu,
    Back,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchSegments,
    IncrementViewCount,
    PreloadImages(Vec<String>),
    LogProgress {
        page_index: usize,
        segment_id: Uuid,
        user_id: Uuid,
    },
    MarkResumable { page_index: usize },
    StopAudio,
    /// Stop everything, then play `source`.
    Play { playback: u64, source: AudioSource },
    TurnPage(usize),
}

/// Pages at or past this index make the story show up as "continue reading".
pub const RESUMABLE_FROM_PAGE: usize = 2;

//=========================================================================================
// Reducer
//=========================================================================================

pub fn transition(
    state: &StoryState,
    ctx: &mut StoryContext,
    event: StoryEvent,
) -> (StoryState, Vec<Effect>) {
    let mut effects = Vec::new();
    let next = match (state, event) {
        (StoryState::Finished, _) => StoryState::Finished,

        (_, StoryEvent::Back) => {
            effects.push(Effect::StopAudio);
            StoryState::Finished
        }
        (_, StoryEvent::ToggleMenu) => {
            ctx.menu_visible = !ctx.menu_visible;
            state.clone()
        }
        (_, StoryEvent::CloseMenu) => {
            ctx.menu_visible = false;
            state.clone()
        }
        (_, StoryEvent::SetVoiceGender(gender)) => {
            ctx.voice_gender = gender;
            ctx.recompute_audio_urls();
            state.clone()
        }
        (_, StoryEvent::AutoPlayChanged) => {
            debug!(auto_play = ctx.auto_play.get(), "Autoplay changed.");
            state.clone()
        }

        // --- Loading ---
        (StoryState::Loading(LoadingStep::FetchingSegments), StoryEvent::SegmentsLoaded(segments)) => {
            if segments.is_empty() {
                StoryState::Error {
                    message: format!("Story {} has no segments", ctx.story_id),
                    retryable: false,
                }
            } else {
                ctx.load_segments(segments);
                effects.push(Effect::IncrementViewCount);
                StoryState::Loading(LoadingStep::IncrementingViewCount)
            }
        }
        (StoryState::Loading(LoadingStep::FetchingSegments), StoryEvent::SegmentsFailed(e)) => {
            StoryState::Error {
                retryable: !matches!(e, PortError::NotFound(_)),
                message: e.to_string(),
            }
        }
        (StoryState::Loading(LoadingStep::IncrementingViewCount), StoryEvent::ViewCountSettled) => {
            if ctx.image_urls.is_empty() {
                StoryState::Ready(ReadyStep::Idle)
            } else {
                effects.push(Effect::PreloadImages(ctx.image_urls.clone()));
                StoryState::Loading(LoadingStep::PreloadingImages)
            }
        }
        (StoryState::Loading(LoadingStep::PreloadingImages), StoryEvent::ImagesReady) => {
            StoryState::Ready(ReadyStep::Idle)
        }
        (StoryState::Loading(_), StoryEvent::ToggleMute) => {
            ctx.muted = !ctx.muted;
            state.clone()
        }
        (StoryState::Loading(_), StoryEvent::ToggleLanguage) => {
            ctx.language = ctx.language.toggled();
            ctx.recompute_audio_urls();
            state.clone()
        }

        // --- Error ---
        (StoryState::Error { .. }, StoryEvent::Retry) => {
            effects.push(Effect::FetchSegments);
            StoryState::Loading(LoadingStep::FetchingSegments)
        }

        // --- Ready ---
        (StoryState::Ready(step), StoryEvent::PageFlipped(page_index)) => {
            if page_index >= ctx.segments.len() {
                warn!(page_index, pages = ctx.segments.len(), "Ignoring flip to a page that does not exist.");
                state.clone()
            } else {
                if *step == ReadyStep::PlayingAudio {
                    ctx.playback += 1;
                    effects.push(Effect::StopAudio);
                }
                ctx.current_page_index = page_index;
                if page_index >= RESUMABLE_FROM_PAGE {
                    effects.push(Effect::MarkResumable { page_index });
                }
                settle(StoryState::Ready(ReadyStep::PageFlipped), ctx, &mut effects)
            }
        }
        (
            StoryState::Ready(ReadyStep::LoggingProgress),
            StoryEvent::ProgressLogged { page_index },
        ) if page_index == ctx.current_page_index => {
            settle(StoryState::Ready(ReadyStep::CheckingAutoPlay), ctx, &mut effects)
        }
        (StoryState::Ready(ReadyStep::PlayingAudio), StoryEvent::AudioFinished { playback })
            if playback == ctx.playback =>
        {
            if ctx.auto_play.get() && ctx.has_next_page() {
                effects.push(Effect::TurnPage(ctx.current_page_index + 1));
            }
            StoryState::Ready(ReadyStep::Idle)
        }
        (
            StoryState::Ready(ReadyStep::PlayingAudio),
            StoryEvent::AudioFailed { playback } | StoryEvent::AudioStopped { playback },
        ) if playback == ctx.playback => StoryState::Ready(ReadyStep::Idle),
        (StoryState::Ready(_), StoryEvent::ToggleLanguage) => {
            ctx.language = ctx.language.toggled();
            ctx.recompute_audio_urls();
            ctx.menu_visible = false;
            start_playback(ctx, &mut effects)
        }
        (StoryState::Ready(step), StoryEvent::ToggleMute) => {
            if ctx.muted {
                ctx.muted = false;
                start_playback(ctx, &mut effects)
            } else {
                ctx.muted = true;
                ctx.playback += 1;
                effects.push(Effect::StopAudio);
                match step {
                    ReadyStep::PlayingAudio => StoryState::Ready(ReadyStep::Idle),
                    _ => state.clone(),
                }
            }
        }
        (StoryState::Ready(step), StoryEvent::Restart) => {
            ctx.playback += 1;
            if *step == ReadyStep::PlayingAudio {
                effects.push(Effect::StopAudio);
            }
            ctx.current_page_index = 0;
            ctx.menu_visible = false;
            effects.push(Effect::TurnPage(0));
            StoryState::Ready(ReadyStep::Idle)
        }

        (state, event) => {
            debug!(state = state.tag(), ?event, "Event ignored in this state.");
            state.clone()
        }
    };
    (next, effects)
}

/// Resolves the transient `pageFlipped` and `checkingAutoPlay` states.
fn settle(mut state: StoryState, ctx: &mut StoryContext, effects: &mut Vec<Effect>) -> StoryState {
    loop {
        state = match state {
            StoryState::Ready(ReadyStep::PageFlipped) => {
                let segment_id = ctx.segments[ctx.current_page_index].id;
                match ctx.user_id {
                    Some(user_id) => {
                        effects.push(Effect::LogProgress {
                            page_index: ctx.current_page_index,
                            segment_id,
                            user_id,
                        });
                        StoryState::Ready(ReadyStep::LoggingProgress)
                    }
                    None => StoryState::Ready(ReadyStep::CheckingAutoPlay),
                }
            }
            StoryState::Ready(ReadyStep::CheckingAutoPlay) => {
                if ctx.should_play_audio() {
                    start_playback(ctx, effects)
                } else {
                    StoryState::Ready(ReadyStep::Idle)
                }
            }
            settled => return settled,
        };
    }
}

/// Plays the current page regardless of mute; callers apply the mute guard.
fn start_playback(ctx: &mut StoryContext, effects: &mut Vec<Effect>) -> StoryState {
    ctx.playback += 1;
    match ctx.current_source() {
        Some(source) => {
            effects.push(Effect::Play {
                playback: ctx.playback,
                source,
            });
            StoryState::Ready(ReadyStep::PlayingAudio)
        }
        None => {
            warn!(
                page_index = ctx.current_page_index,
                language = ctx.language.code(),
                "Page has neither narration nor text to speak."
            );
            effects.push(Effect::StopAudio);
            StoryState::Ready(ReadyStep::Idle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AudioVariant;
    use std::collections::HashMap;

    fn segment(index: u32, with_audio: bool) -> StorySegment {
        StorySegment {
            id: Uuid::new_v4(),
            story_id: Uuid::nil(),
            index,
            text_by_language: HashMap::from([
                (Language::Vi, format!("Trang {index}.")),
                (Language::En, format!("Page {index}.")),
            ]),
            image_url: Some(format!("https://cdn/{index}.png")),
            audio_variants: if with_audio {
                vec![AudioVariant {
                    language: Language::Vi,
                    gender: VoiceGender::Female,
                    audio_url: format!("https://cdn/{index}-vi-f.mp3"),
                }]
            } else {
                Vec::new()
            },
        }
    }

    fn ready_context(auto_play: bool, user_id: Option<Uuid>) -> StoryContext {
        let mut ctx = StoryContext::new(
            Uuid::nil(),
            user_id,
            Language::Vi,
            VoiceGender::Female,
            AutoPlayFlag::new(auto_play),
            false,
        );
        ctx.load_segments(vec![segment(2, false), segment(0, true), segment(1, true)]);
        ctx
    }

    fn playing(ctx: &mut StoryContext) -> StoryState {
        let (state, _) = transition(&StoryState::Ready(ReadyStep::Idle), ctx, StoryEvent::PageFlipped(0));
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        state
    }

    #[test]
    fn loading_runs_fetch_view_count_then_preload() {
        let mut ctx = StoryContext::new(
            Uuid::nil(),
            None,
            Language::Vi,
            VoiceGender::Female,
            AutoPlayFlag::new(true),
            false,
        );
        let state = StoryState::initial();
        let (state, effects) = transition(
            &state,
            &mut ctx,
            StoryEvent::SegmentsLoaded(vec![segment(1, false), segment(0, true)]),
        );
        assert_eq!(state, StoryState::Loading(LoadingStep::IncrementingViewCount));
        assert_eq!(effects, vec![Effect::IncrementViewCount]);
        assert_eq!(ctx.segments[0].index, 0);
        assert_eq!(ctx.audio_urls, vec![Some("https://cdn/0-vi-f.mp3".to_string()), None]);

        let (state, effects) = transition(&state, &mut ctx, StoryEvent::ViewCountSettled);
        assert_eq!(state, StoryState::Loading(LoadingStep::PreloadingImages));
        assert_eq!(
            effects,
            vec![Effect::PreloadImages(vec![
                "https://cdn/0.png".to_string(),
                "https://cdn/1.png".to_string()
            ])]
        );

        let (state, _) = transition(&state, &mut ctx, StoryEvent::ImagesReady);
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
    }

    #[test]
    fn fetch_failure_is_retryable_unless_missing() {
        let mut ctx = ready_context(true, None);
        let (state, _) = transition(
            &StoryState::initial(),
            &mut ctx,
            StoryEvent::SegmentsFailed(PortError::Unexpected("timeout".into())),
        );
        assert!(matches!(state, StoryState::Error { retryable: true, .. }));

        let (state, effects) = transition(&state, &mut ctx, StoryEvent::Retry);
        assert_eq!(state, StoryState::initial());
        assert_eq!(effects, vec![Effect::FetchSegments]);

        let (state, _) = transition(
            &state,
            &mut ctx,
            StoryEvent::SegmentsFailed(PortError::NotFound("story".into())),
        );
        assert!(matches!(state, StoryState::Error { retryable: false, .. }));
    }

    #[test]
    fn flip_without_user_skips_logging_and_plays_narration() {
        let mut ctx = ready_context(true, None);
        let (state, effects) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::PageFlipped(1));
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        assert_eq!(
            effects,
            vec![Effect::Play {
                playback: 1,
                source: AudioSource::Url("https://cdn/1-vi-f.mp3".to_string()),
            }]
        );
    }

    #[test]
    fn flip_with_user_logs_before_checking_autoplay() {
        let user = Uuid::new_v4();
        let mut ctx = ready_context(true, Some(user));
        let segment_id = ctx.segments[2].id;
        let (state, effects) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::PageFlipped(2));
        assert_eq!(state, StoryState::Ready(ReadyStep::LoggingProgress));
        assert_eq!(
            effects,
            vec![
                Effect::MarkResumable { page_index: 2 },
                Effect::LogProgress { page_index: 2, segment_id, user_id: user },
            ]
        );

        // A late completion for another page is ignored.
        let (same, effects) = transition(&state, &mut ctx, StoryEvent::ProgressLogged { page_index: 1 });
        assert_eq!(same, state);
        assert!(effects.is_empty());

        let (state, effects) = transition(&state, &mut ctx, StoryEvent::ProgressLogged { page_index: 2 });
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        assert_eq!(
            effects,
            vec![Effect::Play {
                playback: 1,
                source: AudioSource::Speech {
                    text: "Trang 2.".to_string(),
                    gender: VoiceGender::Female,
                    language: Language::Vi,
                },
            }]
        );
    }

    #[test]
    fn muted_flip_goes_idle() {
        let mut ctx = ready_context(true, None);
        ctx.muted = true;
        let (state, effects) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::PageFlipped(0));
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn audio_finished_without_autoplay_does_not_advance() {
        let mut ctx = ready_context(false, None);
        let state = playing(&mut ctx);
        let playback = ctx.playback;
        let (state, effects) =
            transition(&state, &mut ctx, StoryEvent::AudioFinished { playback });
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn audio_finished_with_autoplay_turns_exactly_one_page() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        let playback = ctx.playback;
        let (state, effects) =
            transition(&state, &mut ctx, StoryEvent::AudioFinished { playback });
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert_eq!(effects, vec![Effect::TurnPage(1)]);
    }

    #[test]
    fn autoplay_is_read_when_audio_finishes() {
        let mut ctx = ready_context(true, None);
        let handle_side = ctx.auto_play.clone();
        let state = playing(&mut ctx);
        assert!(!handle_side.toggle());
        let playback = ctx.playback;
        let (_, effects) = transition(&state, &mut ctx, StoryEvent::AudioFinished { playback });
        assert!(effects.is_empty());
    }

    #[test]
    fn last_page_never_advances() {
        let mut ctx = ready_context(true, None);
        let (state, _) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::PageFlipped(2));
        let playback = ctx.playback;
        let (state, effects) =
            transition(&state, &mut ctx, StoryEvent::AudioFinished { playback });
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_audio_completion_is_ignored() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        let stale = ctx.playback;
        let (state, _) = transition(&state, &mut ctx, StoryEvent::PageFlipped(1));
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        let (after, effects) = transition(&state, &mut ctx, StoryEvent::AudioFinished { playback: stale });
        assert_eq!(after, StoryState::Ready(ReadyStep::PlayingAudio));
        assert!(effects.is_empty());
    }

    #[test]
    fn toggle_language_replays_even_when_muted() {
        let mut ctx = ready_context(true, None);
        ctx.muted = true;
        ctx.menu_visible = true;
        let (state, effects) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::ToggleLanguage);
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        assert_eq!(ctx.language, Language::En);
        assert!(!ctx.menu_visible);
        assert_eq!(
            effects,
            vec![Effect::Play {
                playback: ctx.playback,
                source: AudioSource::Speech {
                    text: "Page 0.".to_string(),
                    gender: VoiceGender::Female,
                    language: Language::En,
                },
            }]
        );
    }

    #[test]
    fn toggle_mute_stops_then_replays() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        let (state, effects) = transition(&state, &mut ctx, StoryEvent::ToggleMute);
        assert!(ctx.muted);
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert_eq!(effects, vec![Effect::StopAudio]);

        let (state, effects) = transition(&state, &mut ctx, StoryEvent::ToggleMute);
        assert!(!ctx.muted);
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        assert!(matches!(effects.as_slice(), [Effect::Play { .. }]));
    }

    #[test]
    fn toggle_autoplay_does_not_touch_audio() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        ctx.auto_play.toggle();
        let (after, effects) = transition(&state, &mut ctx, StoryEvent::AutoPlayChanged);
        assert_eq!(after, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn restart_jumps_to_first_page_and_keeps_preferences() {
        let mut ctx = ready_context(false, None);
        ctx.current_page_index = 2;
        ctx.muted = true;
        ctx.menu_visible = true;
        ctx.language = Language::En;
        let (state, effects) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::Restart);
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert_eq!(effects, vec![Effect::TurnPage(0)]);
        assert_eq!(ctx.current_page_index, 0);
        assert!(!ctx.menu_visible);
        assert!(ctx.muted);
        assert!(!ctx.auto_play.get());
        assert_eq!(ctx.language, Language::En);
    }

    #[test]
    fn narration_stopped_from_outside_returns_to_idle_without_advancing() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        let playback = ctx.playback;
        let (state, effects) = transition(&state, &mut ctx, StoryEvent::AudioStopped { playback });
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert!(effects.is_empty());
        assert_eq!(ctx.current_page_index, 0);
    }

    #[test]
    fn restart_while_playing_silences_the_old_page() {
        let mut ctx = ready_context(true, None);
        let (state, _) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::PageFlipped(1));
        assert_eq!(state, StoryState::Ready(ReadyStep::PlayingAudio));
        let old_playback = ctx.playback;

        let (state, effects) = transition(&state, &mut ctx, StoryEvent::Restart);
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert_eq!(effects, vec![Effect::StopAudio, Effect::TurnPage(0)]);
        assert_eq!(ctx.current_page_index, 0);

        let (state, effects) = transition(
            &state,
            &mut ctx,
            StoryEvent::AudioFinished { playback: old_playback },
        );
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn menu_toggles_leave_playback_alone() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        let (after, effects) = transition(&state, &mut ctx, StoryEvent::ToggleMenu);
        assert_eq!(after, state);
        assert!(effects.is_empty());
        assert!(ctx.menu_visible);
        let (_, _) = transition(&state, &mut ctx, StoryEvent::CloseMenu);
        assert!(!ctx.menu_visible);
    }

    #[test]
    fn back_stops_audio_and_finishes() {
        let mut ctx = ready_context(true, None);
        let state = playing(&mut ctx);
        let (state, effects) = transition(&state, &mut ctx, StoryEvent::Back);
        assert_eq!(state, StoryState::Finished);
        assert_eq!(effects, vec![Effect::StopAudio]);
        let (state, effects) = transition(&state, &mut ctx, StoryEvent::PageFlipped(1));
        assert_eq!(state, StoryState::Finished);
        assert!(effects.is_empty());
    }

    #[test]
    fn out_of_range_flip_is_ignored() {
        let mut ctx = ready_context(true, None);
        let (state, effects) =
            transition(&StoryState::Ready(ReadyStep::Idle), &mut ctx, StoryEvent::PageFlipped(3));
        assert_eq!(state, StoryState::Ready(ReadyStep::Idle));
        assert!(effects.is_empty());
        assert_eq!(ctx.current_page_index, 0);
    }

    #[test]
    fn voice_change_switches_to_matching_narration() {
        let mut ctx = ready_context(true, None);
        let (_, _) = transition(
            &StoryState::Ready(ReadyStep::Idle),
            &mut ctx,
            StoryEvent::SetVoiceGender(VoiceGender::Male),
        );
        assert!(ctx.audio_urls.iter().all(Option::is_none));
        assert!(matches!(ctx.current_source(), Some(AudioSource::Speech { gender: VoiceGender::Male, .. })));
    }
}

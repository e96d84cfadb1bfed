//! services/api/src/web/client.rs
//!
//! The connected app seen through the core ports. Its speaker, its book, its
//! microphone and its navigation are all reached by sending protocol messages
//! and, where the core needs to know when something finished, by waiting for
//! the app's acknowledgement.

use async_trait::async_trait;
use bytes::Bytes;
use ecokids_core::domain::{Language, VoiceGender};
use ecokids_core::ports::{
    AudioPlayer, ImagePreloader, PageTurner, PlaybackEnd, PortError, PortResult,
    SpeechRecognizer, SpeechToTextService, StoryNavigator, TextToSpeechService, TtsQueue,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::web::protocol::ServerMessage;

/// How long a page waits for the app to decode its images before showing anyway.
pub const IMAGE_PRELOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Two minutes of 16 kHz mono 16-bit PCM.
const MAX_RECORDING_BYTES: usize = 16_000 * 2 * 120;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//=========================================================================================
// ClientLink
//=========================================================================================

/// One item for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(ServerMessage),
    /// A message followed by the binary frame it announces, written back to back.
    WithAudio(ServerMessage, Bytes),
}

/// The sending half of a connection, shared by everything that talks to the app.
#[derive(Clone, Debug)]
pub struct ClientLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientLink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Text(message)).is_ok()
    }

    pub fn send_with_audio(&self, message: ServerMessage, audio: Bytes) -> bool {
        self.tx.send(Outbound::WithAudio(message, audio)).is_ok()
    }
}

//=========================================================================================
// ClientSpeaker
//=========================================================================================

struct QueuedSpeech {
    generation: u64,
    text: String,
    language: Language,
}

/// The app's speaker, shared by the reading session (narration) and the
/// assistant (queued speech).
pub struct ClientSpeaker {
    link: ClientLink,
    tts: Arc<dyn TextToSpeechService>,
    next_playback: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<PortResult<PlaybackEnd>>>>,
    queue: mpsc::UnboundedSender<QueuedSpeech>,
    /// Bumped to drop every queued sentence.
    generation: Arc<AtomicU64>,
}

impl ClientSpeaker {
    /// Creates the speaker and starts the worker that synthesizes queued speech in order.
    pub fn new(link: ClientLink, tts: Arc<dyn TextToSpeechService>) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        tokio::spawn(speech_worker(rx, link.clone(), tts.clone(), generation.clone()));
        Arc::new(Self {
            link,
            tts,
            next_playback: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            queue,
            generation,
        })
    }

    /// The app finished playing `playback_id`.
    pub fn finished(&self, playback_id: u64) {
        self.resolve(playback_id, Ok(PlaybackEnd::Finished));
    }

    /// The app could not play `playback_id`.
    pub fn failed(&self, playback_id: u64, message: Option<String>) {
        let message = message.unwrap_or_else(|| "playback failed".to_string());
        self.resolve(playback_id, Err(PortError::Unexpected(message)));
    }

    fn resolve(&self, playback_id: u64, result: PortResult<PlaybackEnd>) {
        match lock(&self.pending).remove(&playback_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(playback_id, "Acknowledgement for a playback no longer waited on."),
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<PortResult<PlaybackEnd>>) {
        let id = self.next_playback.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        (id, rx)
    }

    async fn wait(
        &self,
        playback_id: u64,
        sent: bool,
        rx: oneshot::Receiver<PortResult<PlaybackEnd>>,
    ) -> PortResult<PlaybackEnd> {
        if !sent {
            lock(&self.pending).remove(&playback_id);
            return Err(PortError::Unexpected("The app disconnected".to_string()));
        }
        // A dropped sender means the playback was stopped.
        rx.await.unwrap_or(Ok(PlaybackEnd::Stopped))
    }
}

fn language_of(locale: &str) -> Language {
    locale
        .split(['-', '_'])
        .next()
        .and_then(|code| Language::from_code(&code.to_lowercase()))
        .unwrap_or(Language::Vi)
}

async fn speech_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedSpeech>,
    link: ClientLink,
    tts: Arc<dyn TextToSpeechService>,
    generation: Arc<AtomicU64>,
) {
    while let Some(item) = rx.recv().await {
        if item.generation != generation.load(Ordering::SeqCst) {
            continue;
        }
        match tts.generate_audio(&item.text, VoiceGender::Female, item.language).await {
            // The queue may have been cleared while this sentence was synthesized.
            Ok(audio) if item.generation == generation.load(Ordering::SeqCst) => {
                if !link.send_with_audio(ServerMessage::QueueSpeech { text: item.text }, audio) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to synthesize queued speech: {}", e),
        }
    }
}

#[async_trait]
impl AudioPlayer for ClientSpeaker {
    async fn play(&self, url: &str) -> PortResult<PlaybackEnd> {
        let (playback_id, rx) = self.register();
        let sent = self.link.send(ServerMessage::PlayAudio {
            playback_id,
            url: url.to_string(),
        });
        self.wait(playback_id, sent, rx).await
    }

    async fn synthesize_and_play(
        &self,
        text: &str,
        gender: VoiceGender,
        language: Language,
    ) -> PortResult<PlaybackEnd> {
        let audio = self.tts.generate_audio(text, gender, language).await?;
        let (playback_id, rx) = self.register();
        let sent = self
            .link
            .send_with_audio(ServerMessage::PlaySpeech { playback_id }, audio);
        self.wait(playback_id, sent, rx).await
    }

    async fn stop_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.link.send(ServerMessage::StopAudio);
        for (_, tx) in lock(&self.pending).drain() {
            let _ = tx.send(Ok(PlaybackEnd::Stopped));
        }
    }
}

#[async_trait]
impl TtsQueue for ClientSpeaker {
    async fn enqueue(&self, text: &str, locale: &str) -> PortResult<()> {
        self.queue
            .send(QueuedSpeech {
                generation: self.generation.load(Ordering::SeqCst),
                text: text.to_string(),
                language: language_of(locale),
            })
            .map_err(|_| PortError::Unexpected("The speech queue has shut down".to_string()))
    }

    /// A new reply silences narration too, so the two never overlap.
    async fn clear(&self) {
        AudioPlayer::stop_all(self).await;
    }
}

//=========================================================================================
// ClientBook
//=========================================================================================

/// The app's picture book: it turns pages and decodes images on request.
pub struct ClientBook {
    link: ClientLink,
    images_ready: Mutex<Option<oneshot::Sender<()>>>,
}

impl ClientBook {
    pub fn new(link: ClientLink) -> Arc<Self> {
        Arc::new(Self {
            link,
            images_ready: Mutex::new(None),
        })
    }

    /// The app reported every requested image decoded.
    pub fn images_ready(&self) {
        if let Some(tx) = lock(&self.images_ready).take() {
            let _ = tx.send(());
        }
    }
}

impl PageTurner for ClientBook {
    fn turn_to(&self, page_index: usize) {
        self.link.send(ServerMessage::TurnPage { page_index });
    }
}

#[async_trait]
impl ImagePreloader for ClientBook {
    async fn preload(&self, urls: &[String]) -> PortResult<()> {
        if urls.is_empty() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        *lock(&self.images_ready) = Some(tx);
        if !self.link.send(ServerMessage::PreloadImages { urls: urls.to_vec() }) {
            return Err(PortError::Unexpected("The app disconnected".to_string()));
        }
        match tokio::time::timeout(IMAGE_PRELOAD_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PortError::Unexpected("Image preload was superseded".to_string())),
            Err(_) => {
                warn!(images = urls.len(), "The app never confirmed its images; continuing.");
                Ok(())
            }
        }
    }
}

//=========================================================================================
// ClientNavigator
//=========================================================================================

/// Asks the app to open a story screen.
pub struct ClientNavigator {
    link: ClientLink,
}

impl ClientNavigator {
    pub fn new(link: ClientLink) -> Self {
        Self { link }
    }
}

impl StoryNavigator for ClientNavigator {
    fn open_story(&self, story_id: Uuid) {
        self.link.send(ServerMessage::Navigate { story_id });
    }
}

//=========================================================================================
// ClientMicrophone
//=========================================================================================

#[derive(Default)]
struct Recording {
    listening: bool,
    locale: String,
    pcm: Vec<u8>,
}

/// Buffers the PCM the app streams while listening and transcribes it on stop.
pub struct ClientMicrophone {
    stt: Arc<dyn SpeechToTextService>,
    recording: Mutex<Recording>,
}

impl ClientMicrophone {
    pub fn new(stt: Arc<dyn SpeechToTextService>) -> Arc<Self> {
        Arc::new(Self {
            stt,
            recording: Mutex::new(Recording::default()),
        })
    }

    /// Appends microphone audio. Ignored unless listening.
    pub fn push_audio(&self, data: &[u8]) {
        let mut recording = lock(&self.recording);
        if !recording.listening {
            return;
        }
        let room = MAX_RECORDING_BYTES.saturating_sub(recording.pcm.len());
        if data.len() > room {
            warn!("Recording is too long; dropping audio.");
        }
        recording.pcm.extend_from_slice(&data[..data.len().min(room)]);
    }
}

#[async_trait]
impl SpeechRecognizer for ClientMicrophone {
    async fn start(&self, locale: &str) -> PortResult<()> {
        let mut recording = lock(&self.recording);
        recording.listening = true;
        recording.locale = locale.to_string();
        recording.pcm.clear();
        Ok(())
    }

    async fn stop(&self) -> PortResult<String> {
        let (pcm, locale) = {
            let mut recording = lock(&self.recording);
            recording.listening = false;
            (std::mem::take(&mut recording.pcm), recording.locale.clone())
        };
        if pcm.len() < 2 {
            return Ok(String::new());
        }
        self.stt.transcribe_audio(&pcm, &locale).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locales_pick_the_speech_language() {
        assert_eq!(language_of("en-US"), Language::En);
        assert_eq!(language_of("vi-VN"), Language::Vi);
        assert_eq!(language_of("fr-FR"), Language::Vi);
    }
}

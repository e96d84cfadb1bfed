//! crates/ecokids_core/src/voice.rs
//!
//! Guards the microphone so a recording never starts while the assistant is
//! answering or while one is already running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chat::ChatStatus;
use crate::ports::SpeechRecognizer;

pub struct VoiceInput {
    recognizer: Arc<dyn SpeechRecognizer>,
    recording: AtomicBool,
}

impl VoiceInput {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            recognizer,
            recording: AtomicBool::new(false),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Starts recording. Returns `false` when the guard refused or the recognizer failed.
    pub async fn start(&self, locale: &str, chat_status: ChatStatus) -> bool {
        if chat_status.is_busy() {
            debug!(?chat_status, "Not listening while the assistant is answering.");
            return false;
        }
        if self.recording.swap(true, Ordering::SeqCst) {
            debug!("Already listening.");
            return false;
        }
        if let Err(e) = self.recognizer.start(locale).await {
            warn!("Speech recognition failed to start: {}", e);
            self.recording.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Stops recording and returns the recognized text, if any was heard.
    pub async fn stop(&self) -> Option<String> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return None;
        }
        match self.recognizer.stop().await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                debug!("Nothing was recognized.");
                None
            }
            Err(e) => {
                warn!("Speech recognition failed: {}", e);
                None
            }
        }
    }
}

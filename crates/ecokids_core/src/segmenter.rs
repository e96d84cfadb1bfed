//! crates/ecokids_core/src/segmenter.rs
//!
//! Incremental sentence extraction for streamed model output.
//!
//! Text arrives in arbitrary chunks. After each chunk the buffer is scanned for
//! complete sentences and only the *last* complete one is emitted; anything
//! before it is discarded. A sentence is never emitted twice in a row.

use regex::Regex;
use std::sync::LazyLock;

/// A run of text up to and including one or more terminal punctuation marks.
static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]+").expect("sentence pattern is valid"));

#[derive(Debug, Default, Clone)]
pub struct SentenceSegmenter {
    buffer: String,
    last_emitted: Option<String>,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns the last complete sentence now in the buffer, if it is new.
    pub fn feed(&mut self, chunk: &str) -> Option<String> {
        self.buffer.push_str(chunk);

        let mut end = None;
        let mut sentence = None;
        for found in SENTENCE.find_iter(&self.buffer) {
            end = Some(found.end());
            let text = found.as_str().trim();
            if is_speakable(text) {
                sentence = Some(text.to_string());
            }
        }
        self.buffer.drain(..end?);
        self.emit(sentence?)
    }

    /// Emits the unterminated remainder at end of stream, unless it repeats the last emission.
    pub fn flush(&mut self) -> Option<String> {
        let remainder = std::mem::take(&mut self.buffer).trim().to_string();
        if remainder.is_empty() {
            return None;
        }
        self.emit(remainder)
    }

    /// Forgets the buffer and the duplicate guard.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_emitted = None;
    }

    pub fn last_emitted(&self) -> Option<&str> {
        self.last_emitted.as_deref()
    }

    /// Text received but not yet emitted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn emit(&mut self, sentence: String) -> Option<String> {
        if self.last_emitted.as_deref() == Some(sentence.as_str()) {
            return None;
        }
        self.last_emitted = Some(sentence.clone());
        Some(sentence)
    }
}

fn is_speakable(sentence: &str) -> bool {
    sentence.chars().any(char::is_alphanumeric)
}

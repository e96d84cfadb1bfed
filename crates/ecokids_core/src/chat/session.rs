//! crates/ecokids_core/src/chat/session.rs
//!
//! Streams one assistant turn at a time: user text goes to the model, streamed
//! text is shown live and spoken sentence by sentence, and the finished
//! exchange is written to the conversation log.

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::domain::{ChatMessage, Language};
use crate::ports::{
    ChatRequest, ChatTool, ConversationLog, ModelClient, PortError, PortResult, StreamEvent,
    TtsQueue,
};
use crate::segmenter::SentenceSegmenter;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Eco, a cheerful guide who helps children \
discover stories about nature and the environment. Answer in short, simple sentences that are \
easy to read aloud. Reply in the language the child writes in. When a child wants a story, use \
search_stories to find matching ones and open_story to open the one they pick.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Ready,
    Submitted,
    Streaming,
    /// Published just before a failed turn resets to `Ready`, so watchers
    /// usually miss it. Report failures from `TurnOutcome::Failed` instead.
    Error,
}

impl ChatStatus {
    /// Whether a turn is in flight; the mic and send button are disabled meanwhile.
    pub fn is_busy(self) -> bool {
        matches!(self, ChatStatus::Submitted | ChatStatus::Streaming)
    }
}

#[derive(Debug, PartialEq)]
pub enum TurnOutcome {
    /// The turn finished and this many model messages were persisted.
    Completed { persisted: usize },
    /// The turn was superseded or cancelled by the user. Not an error.
    Cancelled,
    Failed(PortError),
    /// Blank input; nothing was sent.
    Skipped,
}

#[derive(Clone)]
pub struct ChatPorts {
    pub model: Arc<dyn ModelClient>,
    pub log: Arc<dyn ConversationLog>,
    pub tts: Arc<dyn TtsQueue>,
}

#[derive(Clone)]
pub struct ChatConfig {
    pub system_prompt: String,
    pub language: Language,
    pub tools: Vec<Arc<dyn ChatTool>>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            language: Language::Vi,
            tools: Vec::new(),
        }
    }
}

//=========================================================================================
// MessageClock
//=========================================================================================

/// Hands out strictly increasing timestamps, so messages created within the
/// same millisecond still sort in creation order.
#[derive(Debug, Default)]
pub struct MessageClock {
    last: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl MessageClock {
    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stamp = match *last {
            Some(previous) if now <= previous => previous + Duration::milliseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

//=========================================================================================
// ChatSession
//=========================================================================================

struct ActiveTurn {
    id: u64,
    abort: CancellationToken,
}

pub struct ChatSession {
    conversation_id: Uuid,
    config: ChatConfig,
    ports: ChatPorts,
    clock: MessageClock,
    next_turn: AtomicU64,
    active: Mutex<Option<ActiveTurn>>,
    status: watch::Sender<ChatStatus>,
    transcript: watch::Sender<String>,
}

impl ChatSession {
    pub fn new(ports: ChatPorts, conversation_id: Uuid, config: ChatConfig) -> Self {
        Self {
            conversation_id,
            config,
            ports,
            clock: MessageClock::default(),
            next_turn: AtomicU64::new(1),
            active: Mutex::new(None),
            status: watch::Sender::new(ChatStatus::Ready),
            transcript: watch::Sender::new(String::new()),
        }
    }

    /// Resumes `conversation_id`, or starts a new conversation when it is `None`.
    pub async fn open(
        ports: ChatPorts,
        user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        config: ChatConfig,
    ) -> PortResult<Self> {
        let conversation_id = match conversation_id {
            Some(id) => id,
            None => {
                let conversation = ports.log.create_conversation(user_id, None).await?;
                info!(conversation_id = %conversation.id, "Started a new conversation.");
                conversation.id
            }
        };
        Ok(Self::new(ports, conversation_id, config))
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn language(&self) -> Language {
        self.config.language
    }

    pub fn status(&self) -> ChatStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChatStatus> {
        self.status.subscribe()
    }

    /// The live, not yet persisted assistant text of the current turn.
    pub fn subscribe_transcript(&self) -> watch::Receiver<String> {
        self.transcript.subscribe()
    }

    pub async fn history(&self) -> PortResult<Vec<ChatMessage>> {
        self.ports.log.list_ordered(self.conversation_id).await
    }

    /// Cancels the turn in flight, if any.
    pub async fn cancel(&self) {
        if let Some(turn) = self.active.lock().await.as_ref() {
            turn.abort.cancel();
        }
    }

    /// Sends `message` and streams the reply. Supersedes any turn in flight.
    pub async fn send(&self, message: &str) -> TurnOutcome {
        let text = message.trim();
        if text.is_empty() {
            return TurnOutcome::Skipped;
        }

        let (turn_id, abort) = self.begin_turn().await;
        let span = tracing::info_span!("chat_turn", conversation_id = %self.conversation_id, turn = turn_id);

        async {
            self.ports.tts.clear().await;

            // The user's message is durable before the model is contacted.
            let user_message = ChatMessage::from_user_text(self.conversation_id, text, self.clock.next());
            let result = match self.ports.log.append(&user_message).await {
                Ok(()) => self.stream_turn(turn_id, &abort, text, &user_message).await,
                Err(e) => Err(e),
            };
            self.finish_turn(turn_id, result).await
        }
        .instrument(span)
        .await
    }

    async fn begin_turn(&self) -> (u64, CancellationToken) {
        let id = self.next_turn.fetch_add(1, Ordering::SeqCst);
        let abort = CancellationToken::new();
        let mut active = self.active.lock().await;
        if let Some(previous) = active.replace(ActiveTurn {
            id,
            abort: abort.clone(),
        }) {
            debug!(superseded = previous.id, "Aborting the previous turn.");
            previous.abort.cancel();
        }
        self.transcript.send_replace(String::new());
        (id, abort)
    }

    async fn is_active(&self, turn_id: u64) -> bool {
        matches!(self.active.lock().await.as_ref(), Some(turn) if turn.id == turn_id)
    }

    async fn still_current(&self, turn_id: u64, abort: &CancellationToken) -> bool {
        !abort.is_cancelled() && self.is_active(turn_id).await
    }

    async fn set_status(&self, turn_id: u64, status: ChatStatus) {
        if self.is_active(turn_id).await {
            self.status.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });
        }
    }

    async fn stream_turn(
        &self,
        turn_id: u64,
        abort: &CancellationToken,
        text: &str,
        user_message: &ChatMessage,
    ) -> PortResult<usize> {
        self.set_status(turn_id, ChatStatus::Submitted).await;

        let mut history = self.ports.log.list_ordered(self.conversation_id).await?;
        history.retain(|m| m.id != user_message.id);
        if abort.is_cancelled() {
            return Err(PortError::Aborted);
        }

        let request = ChatRequest {
            system_prompt: self.config.system_prompt.clone(),
            history,
            message: text.to_string(),
            tools: self.config.tools.clone(),
        };
        let mut stream = self.ports.model.stream_chat(request, abort.clone()).await?;

        let mut segmenter = SentenceSegmenter::new();
        let produced = loop {
            let item = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(PortError::Aborted),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    self.set_status(turn_id, ChatStatus::Streaming).await;
                    // A newer turn owns the transcript and the speaker now.
                    if !self.still_current(turn_id, abort).await {
                        return Err(PortError::Aborted);
                    }
                    self.transcript.send_modify(|t| t.push_str(&delta));
                    if let Some(sentence) = segmenter.feed(&delta) {
                        self.speak(&sentence).await;
                    }
                }
                Some(Ok(StreamEvent::Finished { messages })) => break messages,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(PortError::Unexpected(
                        "Model stream ended without a final response.".to_string(),
                    ))
                }
            }
        };

        let mut persisted = 0;
        for produced_message in produced {
            if abort.is_cancelled() {
                return Err(PortError::Aborted);
            }
            let message = ChatMessage::new(
                self.conversation_id,
                produced_message.role,
                produced_message.raw_content,
                self.clock.next(),
            );
            self.ports.log.append(&message).await?;
            persisted += 1;
        }

        if !self.still_current(turn_id, abort).await {
            return Err(PortError::Aborted);
        }
        if let Some(remainder) = segmenter.flush() {
            self.speak(&remainder).await;
        }
        Ok(persisted)
    }

    async fn speak(&self, sentence: &str) {
        let locale = self.config.language.locale();
        if let Err(e) = self.ports.tts.enqueue(sentence, locale).await {
            warn!("Failed to queue sentence for speech: {}", e);
        }
    }

    async fn finish_turn(&self, turn_id: u64, result: PortResult<usize>) -> TurnOutcome {
        let outcome = match result {
            Ok(persisted) => {
                info!(persisted, "Chat turn completed.");
                TurnOutcome::Completed { persisted }
            }
            Err(e) if e.is_abort() => {
                info!("Chat turn cancelled.");
                TurnOutcome::Cancelled
            }
            Err(e) => {
                error!("Chat turn failed: {}", e);
                self.transcript.send_replace(String::new());
                self.set_status(turn_id, ChatStatus::Error).await;
                TurnOutcome::Failed(e)
            }
        };

        let mut active = self.active.lock().await;
        if matches!(active.as_ref(), Some(turn) if turn.id == turn_id) {
            *active = None;
            self.transcript.send_replace(String::new());
            self.status.send_replace(ChatStatus::Ready);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_never_repeats_or_goes_backwards() {
        let clock = MessageClock::default();
        let stamps: Vec<_> = (0..50).map(|_| clock.next()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn busy_statuses_block_input() {
        assert!(ChatStatus::Streaming.is_busy());
        assert!(ChatStatus::Submitted.is_busy());
        assert!(!ChatStatus::Ready.is_busy());
        assert!(!ChatStatus::Error.is_busy());
    }
}

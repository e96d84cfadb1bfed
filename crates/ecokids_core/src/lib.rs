pub mod chat;
pub mod domain;
pub mod ports;
pub mod segmenter;
pub mod story;
pub mod voice;

pub use domain::{
    AudioVariant, ChatConversation, ChatMessage, Language, MessageRole, ModelMessage,
    StorySegment, VoiceGender,
};
pub use ports::{
    AudioPlayer, ChatRequest, ChatTool, ConversationLog, ImagePreloader, ModelClient,
    ModelStream, PageTurner, PlaybackEnd, PortError, PortResult, ProgressLogger, ResumeStore,
    SegmentStore, SpeechRecognizer, SpeechToTextService, StoryMatch, StoryNavigator,
    StorySearch, StreamEvent, TextToSpeechService, ToolSpec, TtsQueue, ViewCounter,
};
pub use segmenter::SentenceSegmenter;
pub use voice::VoiceInput;

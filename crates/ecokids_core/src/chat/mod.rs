//! crates/ecokids_core/src/chat/mod.rs
//!
//! The streaming chat assistant and the tools it can call.

pub mod session;
pub mod tools;

pub use session::{
    ChatConfig, ChatPorts, ChatSession, ChatStatus, MessageClock, TurnOutcome,
    DEFAULT_SYSTEM_PROMPT,
};
pub use tools::{OpenStoryTool, StorySearchTool};

//! crates/ecokids_core/src/story/mod.rs
//!
//! Interactive story reading: the state machine and the session that runs it.

pub mod machine;
pub mod session;

pub use machine::{
    AudioSource, AutoPlayFlag, Effect, LoadingStep, ReadyStep, StoryContext, StoryEvent,
    StoryState,
};
pub use session::{StoryHandle, StoryOptions, StoryPorts, StoryReadSession, StorySnapshot};

pub mod chat_llm;
pub mod db;
pub mod openai_http;
pub mod search;
pub mod sst;
pub mod tts;

pub use chat_llm::OpenAiChatAdapter;
pub use db::DbAdapter;
pub use openai_http::OpenAiEndpoint;
pub use search::EmbeddingStorySearch;
pub use sst::OpenAiSstAdapter;
pub use tts::OpenAiTtsAdapter;

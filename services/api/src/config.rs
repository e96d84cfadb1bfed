//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use ecokids_core::chat::DEFAULT_SYSTEM_PROMPT;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub stt_model: String,
    pub tts_voice_female: String,
    pub tts_voice_male: String,
    pub story_search_limit: usize,
    pub cors_origin: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // --- Server and Database Settings ---
        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = PathBuf::from(var_or("PROMPTS_PATH", "./prompts"));

        // --- OpenAI Settings ---
        let openai_api_key = lookup("OPENAI_API_KEY");
        let openai_base_url = var_or("OPENAI_BASE_URL", "https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        let chat_model = var_or("CHAT_MODEL", "gpt-4o-mini");
        let embedding_model = var_or("EMBEDDING_MODEL", "text-embedding-3-small");
        let stt_model = var_or("STT_MODEL", "whisper-1");
        let tts_voice_female = var_or("TTS_VOICE_FEMALE", "nova");
        let tts_voice_male = var_or("TTS_VOICE_MALE", "onyx");

        // --- Assistant and Browser Settings ---
        let limit_str = var_or("STORY_SEARCH_LIMIT", "3");
        let story_search_limit = match limit_str.parse::<usize>() {
            Ok(limit) if limit > 0 => limit,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "STORY_SEARCH_LIMIT".to_string(),
                    format!("'{}' is not a positive number", limit_str),
                ))
            }
        };
        let cors_origin = var_or("CORS_ORIGIN", "http://localhost:8081");

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            prompts_path,
            openai_api_key,
            openai_base_url,
            chat_model,
            embedding_model,
            stt_model,
            tts_voice_female,
            tts_voice_male,
            story_search_limit,
            cors_origin,
        })
    }

    /// The assistant's system prompt: `assistant.txt` under the prompts path, or the built-in one.
    pub fn system_prompt(&self) -> String {
        let path = self.prompts_path.join("assistant.txt");
        match std::fs::read_to_string(&path) {
            Ok(prompt) if !prompt.trim().is_empty() => {
                info!("Loaded system prompt from {}", path.display());
                prompt.trim().to_string()
            }
            _ => DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

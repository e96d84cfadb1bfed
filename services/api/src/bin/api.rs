//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{
        tts::parse_voice, DbAdapter, EmbeddingStorySearch, OpenAiChatAdapter, OpenAiEndpoint,
        OpenAiSstAdapter, OpenAiTtsAdapter,
    },
    config::Config,
    error::ApiError,
    web::{
        identify_user, list_messages_handler, middleware::USER_ID_HEADER, rest::ApiDoc,
        state::AppState, ws_handler,
    },
};
use async_openai::{config::OpenAIConfig, types::audio::SpeechModel, Client};
use axum::{
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool.clone()));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let api_key = config
        .openai_api_key
        .clone()
        .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?;
    let openai_client = Client::with_config(OpenAIConfig::new().with_api_key(api_key.clone()));

    let sst_adapter = Arc::new(OpenAiSstAdapter::new(
        openai_client.clone(),
        config.stt_model.clone(),
    ));
    let tts_adapter = Arc::new(OpenAiTtsAdapter::new(
        openai_client,
        SpeechModel::Tts1Hd,
        parse_voice("TTS_VOICE_FEMALE", &config.tts_voice_female)?,
        parse_voice("TTS_VOICE_MALE", &config.tts_voice_male)?,
    ));

    let endpoint = OpenAiEndpoint::new(
        reqwest::Client::new(),
        config.openai_base_url.clone(),
        api_key,
    );
    let model = Arc::new(OpenAiChatAdapter::new(
        endpoint.clone(),
        config.chat_model.clone(),
    ));
    let search = Arc::new(EmbeddingStorySearch::new(
        endpoint,
        config.embedding_model.clone(),
        db_pool,
    ));

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        config: config.clone(),
        segments: db_adapter.clone(),
        views: db_adapter.clone(),
        progress: db_adapter.clone(),
        resume: db_adapter.clone(),
        conversations: db_adapter,
        model,
        search,
        tts_adapter,
        sst_adapter,
        system_prompt: config.system_prompt(),
    });

    // --- 5. Create the Web Router ---
    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|e| {
        ApiError::Internal(format!("Invalid CORS_ORIGIN '{}': {}", config.cors_origin, e))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(USER_ID_HEADER)]);

    let api_router = Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/conversations/{conversation_id}/messages",
            get(list_messages_handler),
        )
        .layer(axum_middleware::from_fn(identify_user))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

//! services/api/src/adapters/search.rs
//!
//! Similarity search over story embeddings: the query is embedded through the
//! OpenAI-compatible `embeddings` endpoint and matched in PostgreSQL with the
//! `match_stories` function.

use async_trait::async_trait;
use ecokids_core::ports::{PortError, PortResult, StoryMatch, StorySearch};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::adapters::openai_http::OpenAiEndpoint;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(FromRow)]
struct MatchRecord {
    story_id: Uuid,
    title: String,
    content: String,
    similarity: f32,
}

/// Formats an embedding as a pgvector literal, e.g. `[0.1,-0.2]`.
fn vector_literal(embedding: &[f32]) -> String {
    let values: Vec<String> = embedding.iter().map(f32::to_string).collect();
    format!("[{}]", values.join(","))
}

#[derive(Clone)]
pub struct EmbeddingStorySearch {
    endpoint: OpenAiEndpoint,
    model: String,
    pool: PgPool,
}

impl EmbeddingStorySearch {
    pub fn new(endpoint: OpenAiEndpoint, model: String, pool: PgPool) -> Self {
        Self {
            endpoint,
            model,
            pool,
        }
    }

    async fn embed(&self, text: &str) -> PortResult<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let resp = self.endpoint.send(self.endpoint.post("embeddings", &body)).await?;
        let data: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Malformed embedding response: {}", e)))?;
        data.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| PortError::Unexpected("Embedding response was empty".to_string()))
    }
}

#[async_trait]
impl StorySearch for EmbeddingStorySearch {
    async fn search(&self, query: &str, limit: usize) -> PortResult<Vec<StoryMatch>> {
        let embedding = self.embed(query).await?;
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let records = sqlx::query_as::<_, MatchRecord>(
            "SELECT story_id, title, content, similarity FROM match_stories($1::vector, $2)",
        )
        .bind(vector_literal(&embedding))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records
            .into_iter()
            .map(|r| StoryMatch {
                story_id: r.story_id,
                title: r.title,
                content: r.content,
                similarity: r.similarity,
            })
            .collect())
    }
}

//! services/api/src/adapters/openai_http.rs
//!
//! A small OpenAI-compatible HTTP endpoint shared by the chat and embedding
//! adapters, plus the line decoder for server-sent event streams.

use ecokids_core::ports::{PortError, PortResult};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;

#[derive(Clone, Debug)]
pub struct OpenAiEndpoint {
    http: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiEndpoint {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Builds an authenticated JSON POST to `path` under the base URL.
    pub fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}/{}", self.base_url, path.trim_start_matches('/')))
            .header("Content-Type", "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        req
    }

    /// Sends the request and turns transport failures and non-2xx replies into port errors.
    pub async fn send(&self, req: RequestBuilder) -> PortResult<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Request failed: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(PortError::Unexpected(format!("API error {}: {}", status, text)));
        }
        Ok(resp)
    }
}

//=========================================================================================
// Server-sent events
//=========================================================================================

/// Splits a byte stream into the payloads of its `data:` lines.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters split
/// across network chunks decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feeds raw bytes and returns every complete `data:` payload now available.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim().strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

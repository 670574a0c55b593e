//! Chat-completions transport (OpenAI-compatible, streaming).

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::error::TransportError;
use crate::sse::LineSplitter;
use crate::store::Role;

/// Raw response lines in arrival order.
pub type LineStream = BoxStream<'static, Result<String, TransportError>>;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: ChatRequest) -> Result<LineStream, TransportError>;
}

pub struct ChatClient {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    request_timeout: std::time::Duration,
}

impl ChatClient {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            http_client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl ChatTransport for ChatClient {
    async fn open(&self, request: ChatRequest) -> Result<LineStream, TransportError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %request.model, messages = request.messages.len(), "Opening chat stream");

        let mut builder = self
            .http_client
            .post(&url)
            .json(&request)
            .timeout(self.request_timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        // Handle API-level errors (non-2xx status codes)
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(TransportError::Status { status, body });
        }

        Ok(lines(response.bytes_stream()))
    }
}

/// Splits a byte stream into lines; an unterminated tail is flushed when the
/// body ends.
fn lines<S>(bytes: S) -> LineStream
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
{
    let state = (Box::pin(bytes), LineSplitter::new(), false);
    let chunks = stream::unfold(state, |(mut bytes, mut splitter, done)| async move {
        if done {
            return None;
        }
        let batch: Vec<Result<String, TransportError>> = match bytes.next().await {
            Some(Ok(chunk)) => splitter.push(&chunk).into_iter().map(Ok).collect(),
            Some(Err(e)) => {
                let err = TransportError::Read(e.to_string());
                return Some((vec![Err(err)], (bytes, splitter, true)));
            }
            None => {
                let tail: Vec<Result<String, TransportError>> =
                    splitter.finish().into_iter().map(Ok).collect();
                return Some((tail, (bytes, splitter, true)));
            }
        };
        Some((batch, (bytes, splitter, false)))
    });
    chunks.flat_map(stream::iter).boxed()
}

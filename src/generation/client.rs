use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;

use super::decode::LineDecoder;
use super::{Fragment, FragmentStream, GenerationError};
use crate::config::{ChatApi, GenerationSettings};
use crate::models::{ChatMessage, ChatRequest};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// The external chat completion service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issues one streaming request. Dropping the returned stream abandons the call.
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError>;

    /// Collects a whole completion. The stream must reach its completion marker.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, GenerationError> {
        let mut stream = self.stream_chat(messages).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            match fragment? {
                Fragment::Delta(delta) => text.push_str(&delta),
                Fragment::Done(_) => return Ok(text),
            }
        }
        Err(GenerationError::Malformed(
            "stream ended before completion".to_string(),
        ))
    }

    async fn health_check(&self) -> bool;
}

pub struct ChatClient {
    client: Client,
    api: ChatApi,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(settings: &GenerationSettings) -> Result<Self, GenerationError> {
        Self::with_timeout(settings, Duration::from_secs(settings.timeout_secs))
    }

    /// `timeout` bounds the wait for response headers and every silence between chunks.
    pub fn with_timeout(
        settings: &GenerationSettings,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api: settings.api,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            timeout,
        })
    }

    fn chat_url(&self) -> String {
        match self.api {
            ChatApi::OpenAi => format!("{}/chat/completions", self.base_url),
            ChatApi::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    fn health_url(&self) -> String {
        match self.api {
            ChatApi::OpenAi => format!("{}/health/liveliness", self.base_url),
            ChatApi::Ollama => format!("{}/api/tags", self.base_url),
        }
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
        };

        let mut req = self.client.post(self.chat_url()).json(&request);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| GenerationError::Timeout)??;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_stream(response.bytes_stream(), self.api, self.timeout))
    }

    async fn health_check(&self) -> bool {
        let mut req = self.client.get(self.health_url()).timeout(self.timeout);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("Generation service health check failed: {}", e);
                false
            }
        }
    }
}

struct Upstream<S> {
    body: S,
    decoder: LineDecoder,
    pending: VecDeque<Fragment>,
    finished: bool,
}

/// Turns a raw byte stream into fragments. A gap longer than `idle` between chunks ends
/// the stream with `Timeout`.
pub fn decode_stream<S, B, E>(body: S, api: ChatApi, idle: Duration) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<GenerationError> + Send + 'static,
{
    let upstream = Upstream {
        body: Box::pin(tokio_stream::StreamExt::timeout(body, idle)),
        decoder: LineDecoder::new(api),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(upstream, |mut up| async move {
        loop {
            if let Some(fragment) = up.pending.pop_front() {
                return Some((Ok(fragment), up));
            }
            if up.finished {
                return None;
            }

            let step = match up.body.next().await {
                Some(Err(_elapsed)) => Err(GenerationError::Timeout),
                Some(Ok(Err(e))) => Err(e.into()),
                Some(Ok(Ok(bytes))) => up.decoder.push(bytes.as_ref()),
                None => {
                    up.finished = true;
                    up.decoder.finish()
                }
            };
            match step {
                Ok(fragments) => up.pending.extend(fragments),
                Err(e) => {
                    up.finished = true;
                    up.pending.clear();
                    return Some((Err(e), up));
                }
            }
            if up.decoder.is_done() {
                up.finished = true;
            }
        }
    })
    .boxed()
}

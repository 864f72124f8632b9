//! The ask pipeline as a single forward-only producer of stream events.
//!
//! ```text
//! Idle -> RetrievingContext -> AwaitingFirstToken -> Streaming -> Closing -> Closed
//!   \________________\__________________\________________\-> Errored -> Closing
//! ```
//!
//! `RetrievingContext` only runs when grounding was requested. Every path ends with
//! exactly one `close` event. Dropping the stream drops the upstream response with it.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use super::{ChatBackend, Fragment, FragmentStream};
use crate::logger::Logger;
use crate::models::{AskLogEntry, ChatMessage, Source, StreamEvent};
use crate::rag::context::ContextAssembler;

pub struct AskRequest {
    pub owner: String,
    pub question: String,
    pub system_prompt: Option<String>,
    pub rag: bool,
}

/// System prompt (if any) followed by the question, prefixed with context when there is some.
pub fn compose_messages(
    system_prompt: Option<&str>,
    context: &str,
    question: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }
    if context.is_empty() {
        messages.push(ChatMessage::user(question));
    } else {
        messages.push(ChatMessage::user(format!(
            "Context:\n{}\n\nQuestion: {}",
            context, question
        )));
    }
    messages
}

enum Phase {
    Idle,
    RetrievingContext,
    AwaitingFirstToken(Vec<ChatMessage>),
    Streaming(FragmentStream),
    Errored(String),
    Closing,
    Closed,
}

#[derive(Default)]
struct Transcript {
    context: String,
    sources: Vec<Source>,
    answer: String,
    error: Option<String>,
}

struct Run {
    phase: Phase,
    request: AskRequest,
    transcript: Transcript,
    assembler: Arc<ContextAssembler>,
    chat: Arc<dyn ChatBackend>,
    logger: Option<Arc<Logger>>,
}

impl Run {
    fn messages(&self) -> Vec<ChatMessage> {
        compose_messages(
            self.request.system_prompt.as_deref(),
            &self.transcript.context,
            &self.request.question,
        )
    }

    /// Hands the finished interaction to the audit log without waiting for it.
    fn record(&mut self) {
        let Some(logger) = self.logger.clone() else {
            return;
        };
        let transcript = std::mem::take(&mut self.transcript);
        let entry = AskLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            username: self.request.owner.clone(),
            question: self.request.question.clone(),
            rag_context: self.request.rag.then_some(transcript.context),
            sources: serde_json::to_value(&transcript.sources).unwrap_or_default(),
            answer: transcript.answer,
            error: transcript.error,
        };
        tokio::spawn(async move {
            if let Err(e) = logger.log_ask(&entry).await {
                tracing::warn!("Failed to write ask log {}: {}", entry.id, e);
            }
        });
    }

    async fn step(&mut self) -> Option<StreamEvent> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::Idle => {
                    self.phase = if self.request.rag {
                        Phase::RetrievingContext
                    } else {
                        Phase::AwaitingFirstToken(self.messages())
                    };
                }
                Phase::RetrievingContext => {
                    let rag = self
                        .assembler
                        .assemble(&self.request.owner, &self.request.question)
                        .await;
                    self.transcript.context = rag.context;
                    self.transcript.sources = rag.sources.clone();
                    self.phase = Phase::AwaitingFirstToken(self.messages());
                    return Some(StreamEvent::Sources(rag.sources));
                }
                Phase::AwaitingFirstToken(messages) => {
                    self.phase = match self.chat.stream_chat(messages).await {
                        Ok(fragments) => Phase::Streaming(fragments),
                        Err(e) => Phase::Errored(e.to_string()),
                    };
                }
                Phase::Streaming(mut fragments) => match fragments.next().await {
                    Some(Ok(Fragment::Delta(text))) => {
                        self.transcript.answer.push_str(&text);
                        self.phase = Phase::Streaming(fragments);
                        return Some(StreamEvent::Message(text));
                    }
                    Some(Ok(Fragment::Done(meta))) => {
                        self.phase = Phase::Closing;
                        if let Some(meta) = meta {
                            return Some(StreamEvent::Final(meta));
                        }
                    }
                    Some(Err(e)) => self.phase = Phase::Errored(e.to_string()),
                    None => {
                        self.phase = Phase::Errored(
                            "generation stream ended before completion".to_string(),
                        )
                    }
                },
                Phase::Errored(cause) => {
                    tracing::warn!("Ask for {} failed: {}", self.request.owner, cause);
                    self.transcript.error = Some(cause.clone());
                    self.phase = Phase::Closing;
                    return Some(StreamEvent::Error(cause));
                }
                Phase::Closing => {
                    self.record();
                    return Some(StreamEvent::Close);
                }
                Phase::Closed => return None,
            }
        }
    }
}

pub struct GenerationGateway {
    assembler: Arc<ContextAssembler>,
    chat: Arc<dyn ChatBackend>,
    logger: Option<Arc<Logger>>,
}

impl GenerationGateway {
    pub fn new(
        assembler: Arc<ContextAssembler>,
        chat: Arc<dyn ChatBackend>,
        logger: Option<Arc<Logger>>,
    ) -> Self {
        Self {
            assembler,
            chat,
            logger,
        }
    }

    pub fn chat(&self) -> &Arc<dyn ChatBackend> {
        &self.chat
    }

    pub fn ask(&self, request: AskRequest) -> BoxStream<'static, StreamEvent> {
        let run = Run {
            phase: Phase::Idle,
            request,
            transcript: Transcript::default(),
            assembler: Arc::clone(&self.assembler),
            chat: Arc::clone(&self.chat),
            logger: self.logger.clone(),
        };
        futures::stream::unfold(run, |mut run| async move {
            let event = run.step().await?;
            Some((event, run))
        })
        .boxed()
    }
}

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// Content model

/// Structured note body as seen at the API edge. The store keeps it as encoded text,
/// see `store::codec`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteContent {
    #[serde(default)]
    pub text: String,
    /// Ordered media references (base64 payloads or URLs).
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

impl NoteContent {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub title: String,
    pub content: NoteContent,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub journal_id: Option<Uuid>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Opaque structured document, e.g. `{ "mood": "text" }` field definitions.
    pub template: serde_json::Value,
    pub note_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Note,
    Journal,
}

impl ItemKind {
    /// Node label in the content store.
    pub fn label(self) -> &'static str {
        match self {
            ItemKind::Note => "Note",
            ItemKind::Journal => "Journal",
        }
    }
}

/// Trims, drops empties and deduplicates user-supplied tags.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

// Write requests

#[derive(Debug, Clone, Deserialize)]
pub struct NoteCreate {
    pub title: String,
    #[serde(default)]
    pub content: NoteContent,
    #[serde(default)]
    pub journal_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<NoteContent>,
    pub tags: Option<Vec<String>>,
    /// Absent: keep the current journal. `null`: detach. Id: move to that journal.
    #[serde(default, deserialize_with = "deserialize_some")]
    pub journal_id: Option<Option<Uuid>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalCreate {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub template: Option<serde_json::Value>,
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

// Search

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: Uuid,
    pub title: String,
    pub excerpt: String,
    pub score: f64,
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub kind: ItemKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
}

impl SearchResponse {
    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<Vec<SearchResult>> for SearchResponse {
    fn from(results: Vec<SearchResult>) -> Self {
        let total = results.len();
        Self { results, total }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub tags: Option<String>,
}

// Ask stream

#[derive(Debug, Clone, Deserialize)]
pub struct AskParams {
    pub text: String,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub rag: bool,
}

/// Provenance of one context block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub title: String,
}

/// One event of the ask stream. `Close` is always the last one.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Sources(Vec<Source>),
    Message(String),
    Final(serde_json::Value),
    Error(String),
    Close,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Sources(_) => "sources",
            StreamEvent::Message(_) => "message",
            StreamEvent::Final(_) => "final",
            StreamEvent::Error(_) => "error",
            StreamEvent::Close => "close",
        }
    }
}

impl Serialize for StreamEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StreamEvent", 2)?;
        state.serialize_field("type", self.name())?;
        match self {
            StreamEvent::Sources(sources) => state.serialize_field("data", sources)?,
            StreamEvent::Message(text) | StreamEvent::Error(text) => {
                state.serialize_field("data", text)?
            }
            StreamEvent::Final(meta) => state.serialize_field("data", meta)?,
            StreamEvent::Close => state.serialize_field("data", &serde_json::Value::Null)?,
        }
        state.end()
    }
}

// Item endpoints

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteJournalParams {
    pub delete_notes: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbedParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingAck {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub embedded: bool,
    pub dimension: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagList {
    pub tags: Vec<String>,
}

// Assistant helpers

fn default_summary_length() -> usize {
    150
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeRequest {
    pub note_id: Uuid,
    #[serde(default = "default_summary_length")]
    pub max_length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub summary: String,
    pub note_id: Uuid,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordsRequest {
    pub note_id: Uuid,
    #[serde(default)]
    pub apply: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordsResponse {
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRequest {
    pub note_type: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateResponse {
    pub template: String,
    pub title_suggestion: String,
}

// Generation service wire types

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// One OpenAI-style SSE payload. Only the fields the decoder reads are kept.
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChunk {
    #[serde(default)]
    pub message: Option<OllamaMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub total_duration: Option<u64>,
    pub load_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaMessage {
    #[serde(default)]
    pub content: String,
}

// Ask audit log

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogQuery {
    pub username: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AskLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub question: String,
    pub rag_context: Option<String>,
    pub sources: serde_json::Value,
    pub answer: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub logs: Vec<AskLogEntry>,
    pub total: i64,
}

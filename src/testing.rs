//! Deterministic stand-ins for the external collaborators, shared by unit tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::generation::{ChatBackend, Fragment, FragmentStream, GenerationError};
use crate::models::{ChatMessage, ItemKind, Journal, Note, NoteContent};
use crate::rag::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::store::{ContentStore, EmbeddingCandidate, StoreError, VectorHit};

pub fn note(title: &str, text: &str) -> Note {
    let now = Utc::now();
    Note {
        id: Uuid::new_v4(),
        title: title.to_string(),
        content: NoteContent::from_text(text),
        tags: BTreeSet::new(),
        created_at: now,
        updated_at: now,
        journal_id: None,
        embedding: None,
    }
}

pub fn journal(title: &str, description: &str) -> Journal {
    let now = Utc::now();
    Journal {
        id: Uuid::new_v4(),
        title: title.to_string(),
        description: description.to_string(),
        template: Value::Null,
        note_count: 0,
        created_at: now,
        updated_at: now,
        embedding: None,
    }
}

/// Bag-of-words embedder: each lowercase word is hashed into one of `DIMENSION` buckets.
/// Identical texts get identical vectors; texts without shared words are (almost) orthogonal.
pub struct HashEmbedder {
    calls: AtomicUsize,
    failing: AtomicBool,
    /// Calls allowed before the embedder starts failing.
    fail_after: Mutex<Option<usize>>,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl HashEmbedder {
    pub const DIMENSION: usize = 256;

    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            fail_after: Mutex::new(None),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Number of texts embedded so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_after(&self, calls: usize) {
        *self.fail_after.lock().unwrap() = Some(self.calls() + calls);
    }

    /// Pins the vector returned for an exact text.
    pub fn set_override(&self, text: &str, vector: Vec<f32>) {
        self.overrides.lock().unwrap().insert(text.to_string(), vector);
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.overrides.lock().unwrap().get(text) {
            return v.clone();
        }
        let mut v = vec![0.0f32; Self::DIMENSION];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() as usize) % Self::DIMENSION] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimension(&self) -> usize {
        Self::DIMENSION
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let exhausted = self
                .fail_after
                .lock()
                .unwrap()
                .map(|limit| self.calls() >= limit)
                .unwrap_or(false);
            if self.failing.load(Ordering::SeqCst) || exhausted {
                return Err(EmbeddingError::Unavailable("embedder offline".into()));
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            out.push(self.vector_for(&text));
        }
        Ok(out)
    }
}

#[derive(Clone)]
enum Script {
    Reply {
        deltas: Vec<String>,
        meta: Option<Value>,
    },
    Refuse(GenerationError),
    Break {
        deltas: Vec<String>,
        error: GenerationError,
    },
    Truncate {
        deltas: Vec<String>,
    },
}

/// Flags the upstream response as released once the fragment stream holding it is dropped.
struct ReleaseGuard(Arc<AtomicBool>);

impl ReleaseGuard {
    fn hold(&self) {}
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Chat backend replaying a fixed script and recording every request it receives.
pub struct ScriptedChat {
    script: Script,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    pulled: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

fn owned(deltas: &[&str]) -> Vec<String> {
    deltas.iter().map(|d| d.to_string()).collect()
}

impl ScriptedChat {
    fn new(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            pulled: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn replying(deltas: &[&str], meta: Option<Value>) -> Self {
        Self::new(Script::Reply {
            deltas: owned(deltas),
            meta,
        })
    }

    /// Fails before any fragment arrives.
    pub fn refusing(error: GenerationError) -> Self {
        Self::new(Script::Refuse(error))
    }

    /// Streams `deltas`, then fails.
    pub fn breaking(deltas: &[&str], error: GenerationError) -> Self {
        Self::new(Script::Break {
            deltas: owned(deltas),
            error,
        })
    }

    /// Streams `deltas`, then ends without a completion marker.
    pub fn truncating(deltas: &[&str]) -> Self {
        Self::new(Script::Truncate {
            deltas: owned(deltas),
        })
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// Fragments taken from the scripted response so far.
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    /// Whether the last scripted response has been dropped.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError> {
        self.requests.lock().unwrap().push(messages);

        let deltas = |deltas: &[String]| -> Vec<Result<Fragment, GenerationError>> {
            deltas.iter().map(|d| Ok(Fragment::Delta(d.clone()))).collect()
        };
        let items = match &self.script {
            Script::Refuse(error) => return Err(error.clone()),
            Script::Reply { deltas: d, meta } => {
                let mut items = deltas(d);
                items.push(Ok(Fragment::Done(meta.clone())));
                items
            }
            Script::Break { deltas: d, error } => {
                let mut items = deltas(d);
                items.push(Err(error.clone()));
                items
            }
            Script::Truncate { deltas: d } => deltas(d),
        };
        self.released.store(false, Ordering::SeqCst);
        let guard = ReleaseGuard(self.released.clone());
        let pulled = self.pulled.clone();
        Ok(futures::stream::iter(items)
            .map(move |item| {
                guard.hold();
                pulled.fetch_add(1, Ordering::SeqCst);
                item
            })
            .boxed())
    }

    async fn health_check(&self) -> bool {
        !matches!(self.script, Script::Refuse(_))
    }
}

/// A content store whose every call fails.
pub struct FailingStore;

fn offline<T>() -> Result<T, StoreError> {
    Err(StoreError::Backend("store offline".into()))
}

#[async_trait]
impl ContentStore for FailingStore {
    async fn create_note(&self, _: &str, _: &Note) -> Result<(), StoreError> {
        offline()
    }
    async fn get_note(&self, _: &str, _: Uuid) -> Result<Option<Note>, StoreError> {
        offline()
    }
    async fn list_notes(&self, _: &str) -> Result<Vec<Note>, StoreError> {
        offline()
    }
    async fn update_note(&self, _: &str, _: &Note) -> Result<(), StoreError> {
        offline()
    }
    async fn delete_note(&self, _: &str, _: Uuid) -> Result<(), StoreError> {
        offline()
    }
    async fn find_notes_containing(&self, _: &str, _: &str) -> Result<Vec<Note>, StoreError> {
        offline()
    }
    async fn find_notes_tagged(&self, _: &str, _: &[String]) -> Result<Vec<Note>, StoreError> {
        offline()
    }
    async fn list_tags(&self, _: &str) -> Result<Vec<String>, StoreError> {
        offline()
    }
    async fn create_journal(&self, _: &str, _: &Journal) -> Result<(), StoreError> {
        offline()
    }
    async fn get_journal(&self, _: &str, _: Uuid) -> Result<Option<Journal>, StoreError> {
        offline()
    }
    async fn list_journals(&self, _: &str) -> Result<Vec<Journal>, StoreError> {
        offline()
    }
    async fn update_journal(&self, _: &str, _: &Journal) -> Result<(), StoreError> {
        offline()
    }
    async fn delete_journal(&self, _: &str, _: Uuid) -> Result<(), StoreError> {
        offline()
    }
    async fn journal_notes(&self, _: &str, _: Uuid) -> Result<Vec<Note>, StoreError> {
        offline()
    }
    async fn journal_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        offline()
    }
    async fn link_note(&self, _: Uuid, _: Uuid) -> Result<(), StoreError> {
        offline()
    }
    async fn unlink_note(&self, _: Uuid, _: Uuid) -> Result<(), StoreError> {
        offline()
    }
    async fn adjust_note_count(&self, _: Uuid, _: i64) -> Result<(), StoreError> {
        offline()
    }
    async fn count_linked_notes(&self, _: Uuid) -> Result<u64, StoreError> {
        offline()
    }
    async fn set_note_count(&self, _: Uuid, _: u64) -> Result<(), StoreError> {
        offline()
    }
    async fn set_embedding(&self, _: ItemKind, _: Uuid, _: &[f32]) -> Result<(), StoreError> {
        offline()
    }
    async fn missing_embeddings(
        &self,
        _: ItemKind,
        _: usize,
    ) -> Result<Vec<EmbeddingCandidate>, StoreError> {
        offline()
    }
    async fn vector_query(
        &self,
        _: ItemKind,
        _: &str,
        _: &[f32],
        _: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        offline()
    }
    async fn health_check(&self) -> bool {
        false
    }
}

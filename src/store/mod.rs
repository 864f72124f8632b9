pub mod codec;
pub mod memory;
pub mod neo4j;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ItemKind, Journal, Note};

pub use self::memory::MemoryStore;
pub use self::neo4j::Neo4jStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// An item whose stored vector is missing but whose embedding source is non-blank.
#[derive(Debug, Clone)]
pub struct EmbeddingCandidate {
    pub kind: ItemKind,
    pub id: Uuid,
    pub title: String,
    pub text: String,
}

/// One hit of a native vector index lookup.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub kind: ItemKind,
    pub id: Uuid,
    pub title: String,
    /// Note content text or journal description.
    pub text: String,
    pub score: f64,
}

/// The property graph holding users' notes and journals.
///
/// Every owner-taking method only sees items created/owned by that user. Absent and
/// foreign items look the same. Note writes never touch `journalId`; only
/// `link_note`/`unlink_note` do, and each of those writes the scalar and the
/// `BELONGS_TO` relationship in the same statement.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create_note(&self, owner: &str, note: &Note) -> Result<(), StoreError>;
    async fn get_note(&self, owner: &str, id: Uuid) -> Result<Option<Note>, StoreError>;
    /// Newest `updatedAt` first.
    async fn list_notes(&self, owner: &str) -> Result<Vec<Note>, StoreError>;
    /// Writes title, content, tags, `updatedAt` and the embedding (cleared when `None`).
    async fn update_note(&self, owner: &str, note: &Note) -> Result<(), StoreError>;
    async fn delete_note(&self, owner: &str, id: Uuid) -> Result<(), StoreError>;
    /// Case-insensitive literal substring over title and content text.
    async fn find_notes_containing(&self, owner: &str, needle: &str)
        -> Result<Vec<Note>, StoreError>;
    /// Notes carrying at least one of `tags` (compared lowercase).
    async fn find_notes_tagged(&self, owner: &str, tags: &[String])
        -> Result<Vec<Note>, StoreError>;
    async fn list_tags(&self, owner: &str) -> Result<Vec<String>, StoreError>;

    async fn create_journal(&self, owner: &str, journal: &Journal) -> Result<(), StoreError>;
    async fn get_journal(&self, owner: &str, id: Uuid) -> Result<Option<Journal>, StoreError>;
    async fn list_journals(&self, owner: &str) -> Result<Vec<Journal>, StoreError>;
    /// Writes title, description, template, `updatedAt` and the embedding. Never `noteCount`.
    async fn update_journal(&self, owner: &str, journal: &Journal) -> Result<(), StoreError>;
    /// Removes the journal. Any remaining `BELONGS_TO` edges go with it and the matching
    /// `journalId` scalars are cleared.
    async fn delete_journal(&self, owner: &str, id: Uuid) -> Result<(), StoreError>;
    async fn journal_notes(&self, owner: &str, journal_id: Uuid) -> Result<Vec<Note>, StoreError>;
    async fn journal_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn link_note(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError>;
    async fn unlink_note(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError>;
    /// Adds `delta` to `noteCount`, never going below zero.
    async fn adjust_note_count(&self, journal_id: Uuid, delta: i64) -> Result<(), StoreError>;
    async fn count_linked_notes(&self, journal_id: Uuid) -> Result<u64, StoreError>;
    async fn set_note_count(&self, journal_id: Uuid, count: u64) -> Result<(), StoreError>;

    async fn set_embedding(&self, kind: ItemKind, id: Uuid, vector: &[f32])
        -> Result<(), StoreError>;
    async fn missing_embeddings(&self, kind: ItemKind, limit: usize)
        -> Result<Vec<EmbeddingCandidate>, StoreError>;
    /// Top-`k` owned items by the label's vector index, best first.
    async fn vector_query(
        &self,
        kind: ItemKind,
        owner: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError>;

    async fn health_check(&self) -> bool;
}

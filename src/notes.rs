//! Note and journal write paths.
//!
//! The store gives per-statement atomicity only, so linkage writes always go in the same
//! order: link before incrementing `noteCount`, unlink before decrementing it. A crash
//! between the two leaves a counter that `repair_note_counts` recomputes from the edges.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    normalize_tags, EmbeddingAck, Journal, JournalCreate, JournalUpdate, Note, NoteCreate,
    NoteUpdate,
};
use crate::rag::maintenance::{EmbedTarget, EmbeddingMaintenance};
use crate::store::{ContentStore, StoreError};

pub struct NoteService {
    store: Arc<dyn ContentStore>,
    maintenance: Arc<EmbeddingMaintenance>,
}

fn require_title(title: &str) -> Result<String, AppError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    Ok(title.to_string())
}

impl NoteService {
    pub fn new(store: Arc<dyn ContentStore>, maintenance: Arc<EmbeddingMaintenance>) -> Self {
        Self { store, maintenance }
    }

    // Notes

    pub async fn list_notes(&self, owner: &str) -> Result<Vec<Note>, AppError> {
        Ok(self.store.list_notes(owner).await?)
    }

    pub async fn get_note(&self, owner: &str, id: Uuid) -> Result<Note, AppError> {
        self.store
            .get_note(owner, id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn create_note(&self, owner: &str, req: NoteCreate) -> Result<Note, AppError> {
        let title = require_title(&req.title)?;
        if let Some(journal_id) = req.journal_id {
            self.get_journal(owner, journal_id).await?;
        }

        let now = Utc::now();
        let mut note = Note {
            id: Uuid::new_v4(),
            title,
            content: req.content,
            tags: normalize_tags(&req.tags),
            created_at: now,
            updated_at: now,
            journal_id: None,
            embedding: None,
        };
        self.store.create_note(owner, &note).await?;

        if let Some(journal_id) = req.journal_id {
            self.attach(note.id, journal_id).await?;
            note.journal_id = Some(journal_id);
        }

        self.maintenance.refresh(EmbedTarget::from(&note)).await;
        tracing::info!("Created note {} for {}", note.id, owner);
        Ok(note)
    }

    /// Partial update. `journal_id: null` detaches, an id moves the note.
    pub async fn update_note(
        &self,
        owner: &str,
        id: Uuid,
        req: NoteUpdate,
    ) -> Result<Note, AppError> {
        let mut note = self.get_note(owner, id).await?;

        // the target journal is checked before anything is written
        if let Some(Some(journal_id)) = req.journal_id {
            self.get_journal(owner, journal_id).await?;
        }

        let mut text_changed = false;
        if let Some(title) = req.title {
            let title = require_title(&title)?;
            text_changed |= title != note.title;
            note.title = title;
        }
        if let Some(content) = req.content {
            text_changed |= content.text != note.content.text;
            note.content = content;
        }
        if let Some(tags) = req.tags {
            note.tags = normalize_tags(&tags);
        }
        if text_changed {
            note.embedding = None;
        }
        note.updated_at = Utc::now();
        self.store.update_note(owner, &note).await?;

        if let Some(target) = req.journal_id {
            if target != note.journal_id {
                if let Some(previous) = note.journal_id {
                    self.detach(note.id, previous).await?;
                    note.journal_id = None;
                }
                if let Some(next) = target {
                    self.attach(note.id, next).await?;
                    note.journal_id = Some(next);
                }
            }
        }

        if text_changed {
            self.maintenance.refresh(EmbedTarget::from(&note)).await;
        }
        Ok(note)
    }

    pub async fn delete_note(&self, owner: &str, id: Uuid) -> Result<(), AppError> {
        let note = self.get_note(owner, id).await?;
        if let Some(journal_id) = note.journal_id {
            self.detach(note.id, journal_id).await?;
        }
        self.store.delete_note(owner, id).await?;
        tracing::info!("Deleted note {} for {}", id, owner);
        Ok(())
    }

    pub async fn embed_note(&self, owner: &str, id: Uuid, force: bool) -> Result<EmbeddingAck, AppError> {
        let note = self.get_note(owner, id).await?;
        self.embed(EmbedTarget::from(&note), force).await
    }

    pub async fn list_tags(&self, owner: &str) -> Result<Vec<String>, AppError> {
        Ok(self.store.list_tags(owner).await?)
    }

    // Journals

    pub async fn list_journals(&self, owner: &str) -> Result<Vec<Journal>, AppError> {
        Ok(self.store.list_journals(owner).await?)
    }

    pub async fn get_journal(&self, owner: &str, id: Uuid) -> Result<Journal, AppError> {
        self.store
            .get_journal(owner, id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn create_journal(&self, owner: &str, req: JournalCreate) -> Result<Journal, AppError> {
        let now = Utc::now();
        let journal = Journal {
            id: Uuid::new_v4(),
            title: require_title(&req.title)?,
            description: req.description,
            template: req.template,
            note_count: 0,
            created_at: now,
            updated_at: now,
            embedding: None,
        };
        self.store.create_journal(owner, &journal).await?;
        self.maintenance.refresh(EmbedTarget::from(&journal)).await;
        tracing::info!("Created journal {} for {}", journal.id, owner);
        Ok(journal)
    }

    pub async fn update_journal(
        &self,
        owner: &str,
        id: Uuid,
        req: JournalUpdate,
    ) -> Result<Journal, AppError> {
        let mut journal = self.get_journal(owner, id).await?;

        let mut text_changed = false;
        if let Some(title) = req.title {
            let title = require_title(&title)?;
            text_changed |= title != journal.title;
            journal.title = title;
        }
        if let Some(description) = req.description {
            text_changed |= description != journal.description;
            journal.description = description;
        }
        if let Some(template) = req.template {
            journal.template = template;
        }
        if text_changed {
            journal.embedding = None;
        }
        journal.updated_at = Utc::now();
        self.store.update_journal(owner, &journal).await?;

        if text_changed {
            self.maintenance.refresh(EmbedTarget::from(&journal)).await;
        }
        Ok(journal)
    }

    /// `delete_notes` has no default: `Some(true)` deletes the journal's notes with it,
    /// `Some(false)` detaches them, `None` is rejected.
    pub async fn delete_journal(
        &self,
        owner: &str,
        id: Uuid,
        delete_notes: Option<bool>,
    ) -> Result<(), AppError> {
        let Some(delete_notes) = delete_notes else {
            return Err(AppError::Validation(
                "delete_notes must be given as true or false".to_string(),
            ));
        };
        self.get_journal(owner, id).await?;

        for note in self.store.journal_notes(owner, id).await? {
            if delete_notes {
                self.store.delete_note(owner, note.id).await?;
            } else {
                self.detach(note.id, id).await?;
            }
        }
        self.store.delete_journal(owner, id).await?;
        tracing::info!(
            "Deleted journal {} for {} ({})",
            id,
            owner,
            if delete_notes { "notes deleted" } else { "notes detached" }
        );
        Ok(())
    }

    pub async fn journal_notes(&self, owner: &str, id: Uuid) -> Result<Vec<Note>, AppError> {
        self.get_journal(owner, id).await?;
        Ok(self.store.journal_notes(owner, id).await?)
    }

    pub async fn embed_journal(
        &self,
        owner: &str,
        id: Uuid,
        force: bool,
    ) -> Result<EmbeddingAck, AppError> {
        let journal = self.get_journal(owner, id).await?;
        self.embed(EmbedTarget::from(&journal), force).await
    }

    /// Recomputes every journal's `noteCount` from its `BELONGS_TO` edges.
    /// Returns how many journals were rewritten.
    pub async fn repair_note_counts(&self) -> Result<usize, StoreError> {
        let ids = self.store.journal_ids().await?;
        for &id in &ids {
            let count = self.store.count_linked_notes(id).await?;
            self.store.set_note_count(id, count).await?;
        }
        tracing::info!("Repaired noteCount on {} journals", ids.len());
        Ok(ids.len())
    }

    // Linkage

    async fn attach(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError> {
        self.store.link_note(note_id, journal_id).await?;
        self.store.adjust_note_count(journal_id, 1).await
    }

    async fn detach(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError> {
        self.store.unlink_note(note_id, journal_id).await?;
        self.store.adjust_note_count(journal_id, -1).await
    }

    async fn embed(&self, target: EmbedTarget<'_>, force: bool) -> Result<EmbeddingAck, AppError> {
        let vector = if force {
            self.maintenance.recompute(target).await?
        } else {
            self.maintenance.ensure(target).await?
        };
        Ok(EmbeddingAck {
            id: target.id,
            kind: target.kind,
            embedded: vector.is_some(),
            dimension: vector.map(|v| v.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NoteContent;
    use crate::store::MemoryStore;
    use crate::testing::{FailingStore, HashEmbedder};
    use serde_json::Value;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        store: Arc<MemoryStore>,
        embedder: Arc<HashEmbedder>,
        service: NoteService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(HashEmbedder::new());
        let maintenance = Arc::new(EmbeddingMaintenance::new(store.clone(), embedder.clone(), 100));
        let service = NoteService::new(store.clone(), maintenance);
        Fixture {
            store,
            embedder,
            service,
        }
    }

    fn new_note(title: &str, journal_id: Option<Uuid>) -> NoteCreate {
        NoteCreate {
            title: title.to_string(),
            content: NoteContent::from_text("body"),
            journal_id,
            tags: vec![" work ".into(), "work".into()],
        }
    }

    fn new_journal(title: &str) -> JournalCreate {
        JournalCreate {
            title: title.to_string(),
            description: "daily log".to_string(),
            template: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_create_in_journal_links_and_counts() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let note = fx
            .service
            .create_note("alice", new_note("Monday", Some(journal.id)))
            .await
            .unwrap();

        assert_eq!(note.journal_id, Some(journal.id));
        assert_eq!(note.tags.len(), 1);
        let stored = fx.service.get_journal("alice", journal.id).await.unwrap();
        assert_eq!(stored.note_count, 1);
        let linked = fx.service.journal_notes("alice", journal.id).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, note.id);
    }

    #[tokio::test]
    async fn test_detach_and_reattach_round_trip_converges() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let note = fx
            .service
            .create_note("alice", new_note("Monday", Some(journal.id)))
            .await
            .unwrap();

        for _ in 0..3 {
            let detach = NoteUpdate {
                journal_id: Some(None),
                ..NoteUpdate::default()
            };
            let detached = fx.service.update_note("alice", note.id, detach).await.unwrap();
            assert_eq!(detached.journal_id, None);
            assert_eq!(fx.store.count_linked_notes(journal.id).await.unwrap(), 0);
            let j = fx.service.get_journal("alice", journal.id).await.unwrap();
            assert_eq!(j.note_count, 0);

            let attach = NoteUpdate {
                journal_id: Some(Some(journal.id)),
                ..NoteUpdate::default()
            };
            fx.service.update_note("alice", note.id, attach).await.unwrap();
            let j = fx.service.get_journal("alice", journal.id).await.unwrap();
            assert_eq!(j.note_count, 1);
        }
    }

    #[tokio::test]
    async fn test_moving_between_journals_shifts_counts() {
        let fx = fixture();
        let a = fx.service.create_journal("alice", new_journal("A")).await.unwrap();
        let b = fx.service.create_journal("alice", new_journal("B")).await.unwrap();
        let note = fx
            .service
            .create_note("alice", new_note("n", Some(a.id)))
            .await
            .unwrap();

        let moved = NoteUpdate {
            journal_id: Some(Some(b.id)),
            ..NoteUpdate::default()
        };
        fx.service.update_note("alice", note.id, moved).await.unwrap();

        assert_eq!(fx.service.get_journal("alice", a.id).await.unwrap().note_count, 0);
        assert_eq!(fx.service.get_journal("alice", b.id).await.unwrap().note_count, 1);
        let stored = fx.service.get_note("alice", note.id).await.unwrap();
        assert_eq!(stored.journal_id, Some(b.id));
    }

    #[tokio::test]
    async fn test_absent_journal_field_keeps_linkage() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let note = fx
            .service
            .create_note("alice", new_note("n", Some(journal.id)))
            .await
            .unwrap();

        let retitle = NoteUpdate {
            title: Some("renamed".into()),
            ..NoteUpdate::default()
        };
        let updated = fx.service.update_note("alice", note.id, retitle).await.unwrap();
        assert_eq!(updated.journal_id, Some(journal.id));
        assert_eq!(fx.service.get_journal("alice", journal.id).await.unwrap().note_count, 1);
    }

    #[tokio::test]
    async fn test_foreign_journal_is_not_found() {
        let fx = fixture();
        let bobs = fx.service.create_journal("bob", new_journal("Bob's")).await.unwrap();
        let err = fx
            .service
            .create_note("alice", new_note("n", Some(bobs.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
        assert!(fx.service.list_notes("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_title_is_rejected() {
        let fx = fixture();
        let err = assert_err!(fx.service.create_note("alice", new_note("  ", None)).await);
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_note_decrements_count() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let note = fx
            .service
            .create_note("alice", new_note("n", Some(journal.id)))
            .await
            .unwrap();

        fx.service.delete_note("alice", note.id).await.unwrap();
        assert_eq!(fx.service.get_journal("alice", journal.id).await.unwrap().note_count, 0);
        assert!(matches!(
            fx.service.get_note("alice", note.id).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_journal_requires_policy() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let err = fx
            .service
            .delete_journal("alice", journal.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_ok!(fx.service.get_journal("alice", journal.id).await);
    }

    #[tokio::test]
    async fn test_delete_journal_detaches_notes() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let note = fx
            .service
            .create_note("alice", new_note("n", Some(journal.id)))
            .await
            .unwrap();

        fx.service.delete_journal("alice", journal.id, Some(false)).await.unwrap();
        let kept = fx.service.get_note("alice", note.id).await.unwrap();
        assert_eq!(kept.journal_id, None);
        assert!(fx.service.list_journals("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_journal_cascades_to_notes() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        fx.service
            .create_note("alice", new_note("inside", Some(journal.id)))
            .await
            .unwrap();
        let outside = fx.service.create_note("alice", new_note("outside", None)).await.unwrap();

        fx.service.delete_journal("alice", journal.id, Some(true)).await.unwrap();
        let left = fx.service.list_notes("alice").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, outside.id);
    }

    #[tokio::test]
    async fn test_writes_embed_and_text_edits_reembed() {
        let fx = fixture();
        let note = fx.service.create_note("alice", new_note("Garden", None)).await.unwrap();
        assert_eq!(fx.embedder.calls(), 1);

        let retag = NoteUpdate {
            tags: Some(vec!["plants".into()]),
            ..NoteUpdate::default()
        };
        fx.service.update_note("alice", note.id, retag).await.unwrap();
        assert_eq!(fx.embedder.calls(), 1);

        let retext = NoteUpdate {
            content: Some(NoteContent::from_text("tomatoes")),
            ..NoteUpdate::default()
        };
        fx.service.update_note("alice", note.id, retext).await.unwrap();
        assert_eq!(fx.embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_embed_note_is_idempotent_unless_forced() {
        let fx = fixture();
        fx.embedder.set_failing(true);
        let note = fx.service.create_note("alice", new_note("Garden", None)).await.unwrap();
        fx.embedder.set_failing(false);

        let ack = fx.service.embed_note("alice", note.id, false).await.unwrap();
        assert!(ack.embedded);
        assert_eq!(ack.dimension, Some(HashEmbedder::DIMENSION));
        fx.service.embed_note("alice", note.id, false).await.unwrap();
        assert_eq!(fx.embedder.calls(), 1);

        fx.service.embed_note("alice", note.id, true).await.unwrap();
        assert_eq!(fx.embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_embed_failure_is_upstream_unavailable() {
        let fx = fixture();
        fx.embedder.set_failing(true);
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        let err = fx
            .service
            .embed_journal("alice", journal.id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_repair_recomputes_counts_from_edges() {
        let fx = fixture();
        let journal = fx.service.create_journal("alice", new_journal("Diary")).await.unwrap();
        fx.service
            .create_note("alice", new_note("n", Some(journal.id)))
            .await
            .unwrap();
        // simulate a crash between the link and the counter write
        fx.store.adjust_note_count(journal.id, 4).await.unwrap();

        let repaired = assert_ok!(fx.service.repair_note_counts().await);
        assert_eq!(repaired, 1);
        assert_eq!(fx.service.get_journal("alice", journal.id).await.unwrap().note_count, 1);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_on_writes() {
        let embedder = Arc::new(HashEmbedder::new());
        let store: Arc<dyn ContentStore> = Arc::new(FailingStore);
        let maintenance = Arc::new(EmbeddingMaintenance::new(store.clone(), embedder, 10));
        let service = NoteService::new(store, maintenance);

        let err = service.create_note("alice", new_note("n", None)).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::models::{ItemKind, Journal, Note};
use crate::store::{ContentStore, EmbeddingCandidate, StoreError};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("embedding back-fill already in progress")]
    AlreadyRunning,
}

/// `title + " " + text`, or `None` when that is blank.
pub fn embedding_source(title: &str, text: &str) -> Option<String> {
    let source = format!("{} {}", title, text);
    if source.trim().is_empty() {
        None
    } else {
        Some(source)
    }
}

/// Borrowed view of anything that carries an embedding.
#[derive(Debug, Clone, Copy)]
pub struct EmbedTarget<'a> {
    pub kind: ItemKind,
    pub id: Uuid,
    pub title: &'a str,
    pub text: &'a str,
    pub embedding: Option<&'a [f32]>,
}

impl<'a> From<&'a Note> for EmbedTarget<'a> {
    fn from(note: &'a Note) -> Self {
        Self {
            kind: ItemKind::Note,
            id: note.id,
            title: &note.title,
            text: &note.content.text,
            embedding: note.embedding.as_deref(),
        }
    }
}

impl<'a> From<&'a Journal> for EmbedTarget<'a> {
    fn from(journal: &'a Journal) -> Self {
        Self {
            kind: ItemKind::Journal,
            id: journal.id,
            title: &journal.title,
            text: &journal.description,
            embedding: journal.embedding.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub notes: usize,
    pub journals: usize,
    pub skipped: usize,
    pub failed: usize,
    pub passes: usize,
}

impl BackfillReport {
    fn record_embedded(&mut self, kind: ItemKind) {
        match kind {
            ItemKind::Note => self.notes += 1,
            ItemKind::Journal => self.journals += 1,
        }
    }

    pub fn embedded(&self) -> usize {
        self.notes + self.journals
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillStatus {
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_report: Option<BackfillReport>,
    pub last_error: Option<String>,
}

pub struct EmbeddingMaintenance {
    store: Arc<dyn ContentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    status: Mutex<BackfillStatus>,
}

impl EmbeddingMaintenance {
    pub fn new(
        store: Arc<dyn ContentStore>,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            provider,
            batch_size: batch_size.max(1),
            status: Mutex::new(BackfillStatus::default()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub async fn status(&self) -> BackfillStatus {
        self.status.lock().await.clone()
    }

    /// Returns the stored vector, computing and persisting it first when absent.
    /// `Ok(None)` means the item has nothing to embed.
    pub async fn ensure(
        &self,
        target: EmbedTarget<'_>,
    ) -> Result<Option<Vec<f32>>, MaintenanceError> {
        if let Some(existing) = target.embedding {
            return Ok(Some(existing.to_vec()));
        }
        self.recompute(target).await
    }

    /// Embeds the current title and text regardless of any stored vector.
    pub async fn recompute(
        &self,
        target: EmbedTarget<'_>,
    ) -> Result<Option<Vec<f32>>, MaintenanceError> {
        let Some(source) = embedding_source(target.title, target.text) else {
            return Ok(None);
        };
        let vector = self.provider.embed(&source).await?;
        self.store
            .set_embedding(target.kind, target.id, &vector)
            .await?;
        tracing::debug!("Embedded {:?} {}", target.kind, target.id);
        Ok(Some(vector))
    }

    /// Best-effort re-embed after a write. Failures are logged and the vector stays null
    /// until the next lazy ensure or back-fill.
    pub async fn refresh(&self, target: EmbedTarget<'_>) {
        if let Err(e) = self.recompute(target).await {
            tracing::warn!(
                "Embedding refresh for {:?} {} failed: {}",
                target.kind,
                target.id,
                e
            );
        }
    }

    /// Embeds every item of `kinds` lacking a vector, in passes of at most `batch_size`,
    /// until a fixed point. Only one run at a time.
    pub async fn backfill<F>(
        &self,
        kinds: &[ItemKind],
        on_pass: F,
    ) -> Result<BackfillReport, MaintenanceError>
    where
        F: Fn(&BackfillReport) + Send + Sync,
    {
        {
            let mut status = self.status.lock().await;
            if status.is_running {
                return Err(MaintenanceError::AlreadyRunning);
            }
            status.is_running = true;
            status.last_error = None;
        }

        // a panic inside a provider must not leave the guard set
        let result = std::panic::AssertUnwindSafe(self.run_backfill(kinds, &on_pass))
            .catch_unwind()
            .await;

        let mut status = self.status.lock().await;
        status.is_running = false;
        status.last_run_at = Some(Utc::now());
        match result {
            Ok(Ok(report)) => {
                tracing::info!(
                    "Embedding back-fill complete: {} notes, {} journals, {} skipped, {} failed in {} passes",
                    report.notes,
                    report.journals,
                    report.skipped,
                    report.failed,
                    report.passes
                );
                status.last_report = Some(report.clone());
                Ok(report)
            }
            Ok(Err(e)) => {
                tracing::error!("Embedding back-fill error: {}", e);
                status.last_error = Some(e.to_string());
                Err(e)
            }
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    format!("Embedding back-fill panicked: {}", s)
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    format!("Embedding back-fill panicked: {}", s)
                } else {
                    "Embedding back-fill panicked with unknown error".to_string()
                };
                tracing::error!("{}", panic_msg);
                status.last_error = Some(panic_msg.clone());
                Err(MaintenanceError::Store(StoreError::Backend(panic_msg)))
            }
        }
    }

    async fn run_backfill<F>(
        &self,
        kinds: &[ItemKind],
        on_pass: &F,
    ) -> Result<BackfillReport, MaintenanceError>
    where
        F: Fn(&BackfillReport) + Send + Sync,
    {
        let mut report = BackfillReport::default();
        for &kind in kinds {
            // items that could not be embedded this run, so they are counted once
            let mut given_up: HashSet<Uuid> = HashSet::new();
            loop {
                let batch = self.store.missing_embeddings(kind, self.batch_size).await?;
                if batch.is_empty() {
                    break;
                }
                report.passes += 1;

                let full = batch.len() >= self.batch_size;
                let embedded = self.embed_pass(batch, &mut given_up, &mut report).await?;
                on_pass(&report);

                if embedded == 0 || !full {
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn embed_pass(
        &self,
        batch: Vec<EmbeddingCandidate>,
        given_up: &mut HashSet<Uuid>,
        report: &mut BackfillReport,
    ) -> Result<usize, MaintenanceError> {
        let mut pending = Vec::with_capacity(batch.len());
        for candidate in batch {
            match embedding_source(&candidate.title, &candidate.text) {
                Some(source) => pending.push((candidate, source)),
                None => {
                    if given_up.insert(candidate.id) {
                        report.skipped += 1;
                    }
                }
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let sources: Vec<String> = pending.iter().map(|(_, s)| s.clone()).collect();
        let vectors: Vec<Option<Vec<f32>>> = match self.provider.embed_batch(sources).await {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(e) => {
                tracing::warn!("Batch embedding failed, retrying items one by one: {}", e);
                let mut vectors = Vec::with_capacity(pending.len());
                for (candidate, source) in &pending {
                    match self.provider.embed(source).await {
                        Ok(v) => vectors.push(Some(v)),
                        Err(e) => {
                            tracing::warn!(
                                "Embedding {:?} {} failed: {}",
                                candidate.kind,
                                candidate.id,
                                e
                            );
                            vectors.push(None);
                        }
                    }
                }
                vectors
            }
        };

        let mut embedded = 0;
        for ((candidate, _), vector) in pending.into_iter().zip(vectors) {
            match vector {
                Some(vector) => {
                    self.store
                        .set_embedding(candidate.kind, candidate.id, &vector)
                        .await?;
                    report.record_embedded(candidate.kind);
                    embedded += 1;
                }
                None => {
                    if given_up.insert(candidate.id) {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(embedded)
    }
}

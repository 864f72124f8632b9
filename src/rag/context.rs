use std::sync::Arc;

use super::embeddings::EmbeddingProvider;
use crate::config::RagSettings;
use crate::models::{ItemKind, Source};
use crate::store::{ContentStore, StoreError, VectorHit};

/// Grounding text for one question plus where each block came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RagContext {
    pub context: String,
    pub sources: Vec<Source>,
}

impl RagContext {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

const BLOCK_SEPARATOR: &str = "\n\n";

fn format_block(hit: &VectorHit) -> String {
    match hit.kind {
        ItemKind::Note => format!("Note Title: {}\nContent: {}", hit.title, hit.text),
        ItemKind::Journal => format!("Journal Title: {}\nDescription: {}", hit.title, hit.text),
    }
}

fn keep_best(mut hits: Vec<VectorHit>, threshold: f64, max: usize) -> Vec<VectorHit> {
    hits.retain(|hit| hit.score > threshold);
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(max);
    hits
}

/// Joins blocks until `max_chars` is reached. The block crossing the limit is cut short.
fn join_bounded(hits: &[VectorHit], max_chars: usize) -> RagContext {
    let mut out = RagContext::default();
    let mut used = 0usize;

    for hit in hits {
        let separator = if out.context.is_empty() { 0 } else { BLOCK_SEPARATOR.len() };
        let remaining = max_chars.saturating_sub(used + separator);
        if remaining == 0 {
            break;
        }

        let block = format_block(hit);
        let block_chars = block.chars().count();
        if separator > 0 {
            out.context.push_str(BLOCK_SEPARATOR);
        }
        if block_chars > remaining {
            out.context.extend(block.chars().take(remaining));
            used = max_chars;
        } else {
            out.context.push_str(&block);
            used += separator + block_chars;
        }
        out.sources.push(Source {
            id: hit.id,
            kind: hit.kind,
            title: hit.title.clone(),
        });
    }
    out
}

pub struct ContextAssembler {
    store: Arc<dyn ContentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    settings: RagSettings,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn ContentStore>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: RagSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    /// Never fails. Retrieval problems leave the context empty so the question can still
    /// be answered ungrounded.
    pub async fn assemble(&self, owner: &str, question: &str) -> RagContext {
        let vector = match self.provider.embed(question).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!("RAG question embedding failed, continuing ungrounded: {}", e);
                return RagContext::default();
            }
        };

        match self.retrieve(owner, &vector).await {
            Ok(hits) => {
                let context = join_bounded(&hits, self.settings.max_context_chars);
                tracing::info!(
                    "Assembled RAG context for {}: {} sources, {} chars",
                    owner,
                    context.sources.len(),
                    context.context.chars().count()
                );
                context
            }
            Err(e) => {
                tracing::warn!("RAG retrieval failed, continuing ungrounded: {}", e);
                RagContext::default()
            }
        }
    }

    async fn retrieve(&self, owner: &str, vector: &[f32]) -> Result<Vec<VectorHit>, StoreError> {
        let notes = self
            .store
            .vector_query(ItemKind::Note, owner, vector, self.settings.note_candidates)
            .await?;
        let journals = self
            .store
            .vector_query(ItemKind::Journal, owner, vector, self.settings.journal_candidates)
            .await?;

        let threshold = self.settings.similarity_threshold;
        let mut hits = keep_best(notes, threshold, self.settings.max_notes);
        hits.extend(keep_best(journals, threshold, self.settings.max_journals));
        Ok(hits)
    }
}

//! Lexical, tag and semantic retrieval over one user's notes and journals.
//!
//! The three modes are independent and each ranks with its own score; nothing is fused.
//! Every mode is scoped to the requesting owner and answers a too-short query with an
//! empty result rather than an error.

pub mod excerpt;
pub mod similarity;

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::{stream, StreamExt};
use regex::{Regex, RegexBuilder};

use self::excerpt::{excerpt, preview};
use self::similarity::{above_threshold, cosine_similarity};
use crate::config::SearchSettings;
use crate::models::{ItemKind, Note, SearchResponse, SearchResult};
use crate::rag::embeddings::EmbeddingError;
use crate::rag::maintenance::{EmbedTarget, EmbeddingMaintenance};
use crate::store::ContentStore;

/// Items embedded concurrently while lazily filling gaps during a semantic search.
const LAZY_EMBED_CONCURRENCY: usize = 4;

pub struct SearchEngine {
    store: Arc<dyn ContentStore>,
    maintenance: Arc<EmbeddingMaintenance>,
    settings: SearchSettings,
}

/// Comma separated list to a lowercase, deduplicated tag set.
pub fn parse_tag_query(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Query text as a literal, case-insensitive pattern.
fn literal_pattern(query: &str) -> Option<Regex> {
    RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .ok()
}

fn newest_first_within_score(results: &mut [(SearchResult, Note)]) {
    results.sort_by(|(a, na), (b, nb)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| nb.updated_at.cmp(&na.updated_at))
    });
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn ContentStore>,
        maintenance: Arc<EmbeddingMaintenance>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            store,
            maintenance,
            settings,
        }
    }

    fn too_short(&self, query: &str) -> bool {
        query.chars().filter(|c| !c.is_whitespace()).count() < self.settings.min_query_chars
    }

    /// Title match scores `lexical_title_score`, content-only match `lexical_content_score`.
    pub async fn lexical(&self, owner: &str, query: &str) -> SearchResponse {
        let query = query.trim();
        if self.too_short(query) {
            return SearchResponse::empty();
        }
        let Some(pattern) = literal_pattern(query) else {
            return SearchResponse::empty();
        };

        let notes = match self.store.find_notes_containing(owner, query).await {
            Ok(notes) => notes,
            Err(e) => {
                tracing::warn!("Lexical search failed for {}: {}", owner, e);
                return SearchResponse::empty();
            }
        };

        let mut scored: Vec<(SearchResult, Note)> = notes
            .into_iter()
            .filter_map(|note| {
                let score = if pattern.is_match(&note.title) {
                    self.settings.lexical_title_score
                } else if pattern.is_match(&note.content.text) {
                    self.settings.lexical_content_score
                } else {
                    return None;
                };
                let result = SearchResult {
                    id: note.id,
                    title: note.title.clone(),
                    excerpt: excerpt(&note.content.text, &pattern),
                    score,
                    tags: note.tags.iter().cloned().collect(),
                    kind: ItemKind::Note,
                };
                Some((result, note))
            })
            .collect();

        newest_first_within_score(&mut scored);
        scored.into_iter().map(|(r, _)| r).collect::<Vec<_>>().into()
    }

    /// Score is the number of query tags the note carries.
    pub async fn by_tags(&self, owner: &str, raw_tags: &str) -> SearchResponse {
        if self.too_short(raw_tags) {
            return SearchResponse::empty();
        }
        let wanted = parse_tag_query(raw_tags);
        if wanted.is_empty() {
            return SearchResponse::empty();
        }
        let wanted_list: Vec<String> = wanted.iter().cloned().collect();

        let notes = match self.store.find_notes_tagged(owner, &wanted_list).await {
            Ok(notes) => notes,
            Err(e) => {
                tracing::warn!("Tag search failed for {}: {}", owner, e);
                return SearchResponse::empty();
            }
        };

        let mut scored: Vec<(SearchResult, Note)> = notes
            .into_iter()
            .filter_map(|note| {
                let matching = note
                    .tags
                    .iter()
                    .map(|t| t.to_lowercase())
                    .collect::<BTreeSet<_>>()
                    .intersection(&wanted)
                    .count();
                if matching == 0 {
                    return None;
                }
                let result = SearchResult {
                    id: note.id,
                    title: note.title.clone(),
                    excerpt: preview(&note.content.text),
                    score: matching as f64,
                    tags: note.tags.iter().cloned().collect(),
                    kind: ItemKind::Note,
                };
                Some((result, note))
            })
            .collect();

        newest_first_within_score(&mut scored);
        scored.into_iter().map(|(r, _)| r).collect::<Vec<_>>().into()
    }

    /// Cosine similarity against every owned note and journal, embedding missing ones on
    /// the way. Fails only when the query itself cannot be embedded.
    pub async fn semantic(&self, owner: &str, query: &str) -> Result<SearchResponse, EmbeddingError> {
        let query = query.trim();
        if self.too_short(query) {
            return Ok(SearchResponse::empty());
        }
        let query_vector = self.maintenance.provider().embed(query).await?;

        let notes = self.store.list_notes(owner).await.unwrap_or_else(|e| {
            tracing::warn!("Semantic search could not list notes for {}: {}", owner, e);
            Vec::new()
        });
        let journals = self.store.list_journals(owner).await.unwrap_or_else(|e| {
            tracing::warn!("Semantic search could not list journals for {}: {}", owner, e);
            Vec::new()
        });

        let candidates: Vec<(EmbedTarget<'_>, Vec<String>)> = notes
            .iter()
            .map(|n| (EmbedTarget::from(n), n.tags.iter().cloned().collect()))
            .chain(journals.iter().map(|j| (EmbedTarget::from(j), Vec::new())))
            .collect();

        let maintenance = &self.maintenance;
        let query_vector = &query_vector;
        let lookups: Vec<_> = candidates
            .into_iter()
            .map(|(target, tags)| async move {
                let vector = match maintenance.ensure(target).await {
                    Ok(Some(vector)) => vector,
                    Ok(None) => return None,
                    Err(e) => {
                        tracing::debug!(
                            "Excluding {:?} {} from semantic ranking: {}",
                            target.kind,
                            target.id,
                            e
                        );
                        return None;
                    }
                };
                let score = cosine_similarity(query_vector, &vector)?;
                Some(SearchResult {
                    id: target.id,
                    title: target.title.to_string(),
                    excerpt: preview(target.text),
                    score,
                    tags,
                    kind: target.kind,
                })
            })
            .collect();
        let mut results: Vec<SearchResult> = stream::iter(lookups)
            .buffered(LAZY_EMBED_CONCURRENCY)
            .filter_map(|r| async move { r })
            .filter(|r| {
                let keep = above_threshold(r.score, self.settings.semantic_threshold);
                async move { keep }
            })
            .collect()
            .await;

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(self.settings.semantic_limit);
        Ok(results.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::normalize_tags;
    use crate::rag::embeddings::EmbeddingProvider;
    use crate::store::MemoryStore;
    use crate::testing::{journal, note, FailingStore, HashEmbedder};
    use chrono::{Duration, Utc};

    struct Fixture {
        store: Arc<MemoryStore>,
        embedder: Arc<HashEmbedder>,
        engine: SearchEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(HashEmbedder::new());
        let maintenance = Arc::new(EmbeddingMaintenance::new(store.clone(), embedder.clone(), 100));
        let engine = SearchEngine::new(store.clone(), maintenance, SearchSettings::default());
        Fixture {
            store,
            embedder,
            engine,
        }
    }

    #[tokio::test]
    async fn test_title_match_outranks_content_match() {
        let f = fixture();
        let now = Utc::now();
        let mut meeting = note("Meeting notes", "");
        let mut grocery = note("Grocery list", "remember the meeting");
        meeting.updated_at = now;
        grocery.updated_at = now;
        f.store.create_note("alice", &grocery).await.unwrap();
        f.store.create_note("alice", &meeting).await.unwrap();

        let response = f.engine.lexical("alice", "meeting").await;
        assert_eq!(response.total, 2);
        assert_eq!(response.results[0].id, meeting.id);
        assert_eq!(response.results[0].score, 3.0);
        assert_eq!(response.results[1].id, grocery.id);
        assert_eq!(response.results[1].score, 1.0);
        assert_eq!(response.results[1].excerpt, "remember the meeting");
        assert_eq!(response.results[0].excerpt, "");
    }

    #[tokio::test]
    async fn test_lexical_ties_break_by_recency() {
        let f = fixture();
        let mut older = note("meeting one", "");
        let mut newer = note("meeting two", "");
        older.updated_at = Utc::now() - Duration::hours(1);
        newer.updated_at = Utc::now();
        f.store.create_note("alice", &older).await.unwrap();
        f.store.create_note("alice", &newer).await.unwrap();

        let response = f.engine.lexical("alice", "MEETING").await;
        assert_eq!(response.results[0].id, newer.id);
        assert_eq!(response.results[1].id, older.id);
    }

    #[tokio::test]
    async fn test_lexical_is_owner_scoped() {
        let f = fixture();
        f.store.create_note("bob", &note("meeting", "meeting")).await.unwrap();
        assert_eq!(f.engine.lexical("alice", "meeting").await.total, 0);
    }

    #[tokio::test]
    async fn test_special_characters_are_literal() {
        let f = fixture();
        let dotted = note("v1.2 release", "");
        let other = note("v102 release", "");
        f.store.create_note("alice", &dotted).await.unwrap();
        f.store.create_note("alice", &other).await.unwrap();

        let response = f.engine.lexical("alice", "1.2").await;
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].id, dotted.id);
        assert_eq!(f.engine.lexical("alice", ".*").await.total, 0);
    }

    #[tokio::test]
    async fn test_short_queries_return_empty() {
        let f = fixture();
        f.store.create_note("alice", &note("a", "a")).await.unwrap();
        assert_eq!(f.engine.lexical("alice", " a ").await.total, 0);
        assert_eq!(f.engine.by_tags("alice", "a").await.total, 0);
        assert_eq!(f.engine.semantic("alice", "  ").await.unwrap().total, 0);
        assert_eq!(f.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_tag_score_is_intersection_size() {
        let f = fixture();
        let mut both = note("both", "");
        both.tags = normalize_tags(["work", "Ideas"]);
        let mut one = note("one", "");
        one.tags = normalize_tags(["work", "home"]);
        let mut none = note("none", "");
        none.tags = normalize_tags(["garden"]);
        for n in [&both, &one, &none] {
            f.store.create_note("alice", n).await.unwrap();
        }

        let response = f.engine.by_tags("alice", "work, ideas ,WORK").await;
        assert_eq!(response.total, 2);
        assert_eq!(response.results[0].id, both.id);
        assert_eq!(response.results[0].score, 2.0);
        assert_eq!(response.results[1].score, 1.0);
    }

    #[tokio::test]
    async fn test_semantic_finds_item_by_its_own_text() {
        let f = fixture();
        let target = note("Tomato planting", "sow seeds indoors in march");
        let other = note("Tax return", "file before april deadline");
        let diary = journal("Travel log", "trains across europe");
        f.store.create_note("alice", &target).await.unwrap();
        f.store.create_note("alice", &other).await.unwrap();
        f.store.create_journal("alice", &diary).await.unwrap();

        let response = f
            .engine
            .semantic("alice", "Tomato planting sow seeds indoors in march")
            .await
            .unwrap();
        assert_eq!(response.results[0].id, target.id);
        assert!(response.results[0].score >= 0.99);
        assert!(response.results.iter().all(|r| r.score > 0.2));

        // vectors were back-filled lazily
        assert!(f.store.missing_embeddings(ItemKind::Note, 10).await.unwrap().is_empty());
        assert!(f.store.missing_embeddings(ItemKind::Journal, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_semantic_threshold_is_strict() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(HashEmbedder::new());
        let maintenance = Arc::new(EmbeddingMaintenance::new(store.clone(), embedder.clone(), 100));

        let query = "boundary probe";
        embedder.set_override(query, vec![1.0, 0.0]);
        let at_vector = [0.2f32, 0.9];
        let at_score = cosine_similarity(&[1.0, 0.0], &at_vector).unwrap();

        let settings = SearchSettings {
            semantic_threshold: at_score,
            ..SearchSettings::default()
        };
        let engine = SearchEngine::new(store.clone(), maintenance, settings);

        let at = note("at threshold", "");
        let above = note("above threshold", "");
        store.create_note("alice", &at).await.unwrap();
        store.create_note("alice", &above).await.unwrap();
        store.set_embedding(ItemKind::Note, at.id, &at_vector).await.unwrap();
        store.set_embedding(ItemKind::Note, above.id, &[0.2001, 0.9]).await.unwrap();

        let response = engine.semantic("alice", query).await.unwrap();
        let ids: Vec<_> = response.results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![above.id]);
    }

    #[tokio::test]
    async fn test_semantic_excludes_items_that_cannot_be_embedded() {
        let f = fixture();
        let ready = note("ready note", "already embedded");
        f.store.create_note("alice", &ready).await.unwrap();
        let v = f.embedder.embed("ready note already embedded").await.unwrap();
        f.store.set_embedding(ItemKind::Note, ready.id, &v).await.unwrap();
        f.store
            .create_note("alice", &note("pending note", "never embedded"))
            .await
            .unwrap();

        // provider recovers for the query only
        f.embedder.fail_after(1);
        let response = f
            .engine
            .semantic("alice", "ready note already embedded")
            .await
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].id, ready.id);
    }

    #[tokio::test]
    async fn test_semantic_query_embedding_failure_is_an_error() {
        let f = fixture();
        f.embedder.set_failing(true);
        assert!(f.engine.semantic("alice", "anything").await.is_err());
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_empty() {
        let embedder = Arc::new(HashEmbedder::new());
        let store: Arc<dyn ContentStore> = Arc::new(FailingStore);
        let maintenance = Arc::new(EmbeddingMaintenance::new(store.clone(), embedder, 100));
        let engine = SearchEngine::new(store, maintenance, SearchSettings::default());

        assert_eq!(engine.lexical("alice", "meeting").await.total, 0);
        assert_eq!(engine.by_tags("alice", "work").await.total, 0);
        assert_eq!(engine.semantic("alice", "meeting").await.unwrap().total, 0);
    }
}

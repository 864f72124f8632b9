use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ContentStore, EmbeddingCandidate, StoreError, VectorHit};
use crate::models::{ItemKind, Journal, Note};
use crate::search::similarity::cosine_similarity;

struct StoredNote {
    owner: String,
    note: Note,
}

struct StoredJournal {
    owner: String,
    journal: Journal,
}

#[derive(Default)]
struct Graph {
    notes: HashMap<Uuid, StoredNote>,
    journals: HashMap<Uuid, StoredJournal>,
    /// `(note, journal)` pairs of BELONGS_TO relationships.
    belongs_to: HashSet<(Uuid, Uuid)>,
}

impl Graph {
    fn owned_note(&self, owner: &str, id: Uuid) -> Option<&StoredNote> {
        self.notes.get(&id).filter(|stored| stored.owner == owner)
    }

    fn owned_journal(&self, owner: &str, id: Uuid) -> Option<&StoredJournal> {
        self.journals.get(&id).filter(|stored| stored.owner == owner)
    }

    fn notes_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a Note> + 'a {
        self.notes
            .values()
            .filter(move |stored| stored.owner == owner)
            .map(|stored| &stored.note)
    }
}

fn newest_first(mut notes: Vec<Note>) -> Vec<Note> {
    notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    notes
}

/// In-process realisation of the content graph, used for tests and single-node dev runs.
#[derive(Default)]
pub struct MemoryStore {
    graph: RwLock<Graph>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn create_note(&self, owner: &str, note: &Note) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        if graph.notes.contains_key(&note.id) {
            return Err(StoreError::Conflict(format!("note {} already exists", note.id)));
        }
        let mut note = note.clone();
        note.journal_id = None;
        graph.notes.insert(
            note.id,
            StoredNote {
                owner: owner.to_string(),
                note,
            },
        );
        Ok(())
    }

    async fn get_note(&self, owner: &str, id: Uuid) -> Result<Option<Note>, StoreError> {
        let graph = self.graph.read().await;
        Ok(graph.owned_note(owner, id).map(|stored| stored.note.clone()))
    }

    async fn list_notes(&self, owner: &str) -> Result<Vec<Note>, StoreError> {
        let graph = self.graph.read().await;
        Ok(newest_first(graph.notes_of(owner).cloned().collect()))
    }

    async fn update_note(&self, owner: &str, note: &Note) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let stored = graph
            .notes
            .get_mut(&note.id)
            .filter(|stored| stored.owner == owner)
            .ok_or(StoreError::NotFound)?;
        stored.note.title = note.title.clone();
        stored.note.content = note.content.clone();
        stored.note.tags = note.tags.clone();
        stored.note.updated_at = note.updated_at;
        stored.note.embedding = note.embedding.clone();
        Ok(())
    }

    async fn delete_note(&self, owner: &str, id: Uuid) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        if graph.owned_note(owner, id).is_none() {
            return Err(StoreError::NotFound);
        }
        graph.notes.remove(&id);
        graph.belongs_to.retain(|(note, _)| *note != id);
        Ok(())
    }

    async fn find_notes_containing(
        &self,
        owner: &str,
        needle: &str,
    ) -> Result<Vec<Note>, StoreError> {
        let needle = needle.to_lowercase();
        let graph = self.graph.read().await;
        let found = graph
            .notes_of(owner)
            .filter(|note| {
                note.title.to_lowercase().contains(&needle)
                    || note.content.text.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        Ok(newest_first(found))
    }

    async fn find_notes_tagged(
        &self,
        owner: &str,
        tags: &[String],
    ) -> Result<Vec<Note>, StoreError> {
        let wanted: HashSet<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        let graph = self.graph.read().await;
        let found = graph
            .notes_of(owner)
            .filter(|note| note.tags.iter().any(|t| wanted.contains(&t.to_lowercase())))
            .cloned()
            .collect();
        Ok(newest_first(found))
    }

    async fn list_tags(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let graph = self.graph.read().await;
        let tags: BTreeSet<String> = graph
            .notes_of(owner)
            .flat_map(|note| note.tags.iter().cloned())
            .collect();
        Ok(tags.into_iter().collect())
    }

    async fn create_journal(&self, owner: &str, journal: &Journal) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        if graph.journals.contains_key(&journal.id) {
            return Err(StoreError::Conflict(format!(
                "journal {} already exists",
                journal.id
            )));
        }
        let mut journal = journal.clone();
        journal.note_count = 0;
        graph.journals.insert(
            journal.id,
            StoredJournal {
                owner: owner.to_string(),
                journal,
            },
        );
        Ok(())
    }

    async fn get_journal(&self, owner: &str, id: Uuid) -> Result<Option<Journal>, StoreError> {
        let graph = self.graph.read().await;
        Ok(graph.owned_journal(owner, id).map(|stored| stored.journal.clone()))
    }

    async fn list_journals(&self, owner: &str) -> Result<Vec<Journal>, StoreError> {
        let graph = self.graph.read().await;
        let mut journals: Vec<Journal> = graph
            .journals
            .values()
            .filter(|stored| stored.owner == owner)
            .map(|stored| stored.journal.clone())
            .collect();
        journals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(journals)
    }

    async fn update_journal(&self, owner: &str, journal: &Journal) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let stored = graph
            .journals
            .get_mut(&journal.id)
            .filter(|stored| stored.owner == owner)
            .ok_or(StoreError::NotFound)?;
        stored.journal.title = journal.title.clone();
        stored.journal.description = journal.description.clone();
        stored.journal.template = journal.template.clone();
        stored.journal.updated_at = journal.updated_at;
        stored.journal.embedding = journal.embedding.clone();
        Ok(())
    }

    async fn delete_journal(&self, owner: &str, id: Uuid) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        if graph.owned_journal(owner, id).is_none() {
            return Err(StoreError::NotFound);
        }
        graph.journals.remove(&id);
        graph.belongs_to.retain(|(_, journal)| *journal != id);
        for stored in graph.notes.values_mut() {
            if stored.note.journal_id == Some(id) {
                stored.note.journal_id = None;
            }
        }
        Ok(())
    }

    async fn journal_notes(&self, owner: &str, journal_id: Uuid) -> Result<Vec<Note>, StoreError> {
        let graph = self.graph.read().await;
        if graph.owned_journal(owner, journal_id).is_none() {
            return Ok(Vec::new());
        }
        let notes = graph
            .belongs_to
            .iter()
            .filter(|(_, journal)| *journal == journal_id)
            .filter_map(|(note, _)| graph.notes.get(note))
            .map(|stored| stored.note.clone())
            .collect();
        Ok(newest_first(notes))
    }

    async fn journal_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let graph = self.graph.read().await;
        Ok(graph.journals.keys().copied().collect())
    }

    async fn link_note(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        if !graph.journals.contains_key(&journal_id) {
            return Err(StoreError::NotFound);
        }
        let stored = graph.notes.get_mut(&note_id).ok_or(StoreError::NotFound)?;
        stored.note.journal_id = Some(journal_id);
        graph.belongs_to.insert((note_id, journal_id));
        Ok(())
    }

    async fn unlink_note(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let stored = graph.notes.get_mut(&note_id).ok_or(StoreError::NotFound)?;
        if stored.note.journal_id == Some(journal_id) {
            stored.note.journal_id = None;
        }
        graph.belongs_to.remove(&(note_id, journal_id));
        Ok(())
    }

    async fn adjust_note_count(&self, journal_id: Uuid, delta: i64) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let stored = graph
            .journals
            .get_mut(&journal_id)
            .ok_or(StoreError::NotFound)?;
        let next = stored.journal.note_count as i64 + delta;
        stored.journal.note_count = next.max(0) as u64;
        Ok(())
    }

    async fn count_linked_notes(&self, journal_id: Uuid) -> Result<u64, StoreError> {
        let graph = self.graph.read().await;
        if !graph.journals.contains_key(&journal_id) {
            return Err(StoreError::NotFound);
        }
        Ok(graph
            .belongs_to
            .iter()
            .filter(|(_, journal)| *journal == journal_id)
            .count() as u64)
    }

    async fn set_note_count(&self, journal_id: Uuid, count: u64) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let stored = graph
            .journals
            .get_mut(&journal_id)
            .ok_or(StoreError::NotFound)?;
        stored.journal.note_count = count;
        Ok(())
    }

    async fn set_embedding(
        &self,
        kind: ItemKind,
        id: Uuid,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        let slot = match kind {
            ItemKind::Note => graph.notes.get_mut(&id).map(|s| &mut s.note.embedding),
            ItemKind::Journal => graph.journals.get_mut(&id).map(|s| &mut s.journal.embedding),
        };
        *slot.ok_or(StoreError::NotFound)? = Some(vector.to_vec());
        Ok(())
    }

    async fn missing_embeddings(
        &self,
        kind: ItemKind,
        limit: usize,
    ) -> Result<Vec<EmbeddingCandidate>, StoreError> {
        let graph = self.graph.read().await;
        let candidates: Vec<EmbeddingCandidate> = match kind {
            ItemKind::Note => graph
                .notes
                .values()
                .map(|s| &s.note)
                .filter(|n| n.embedding.is_none())
                .map(|n| EmbeddingCandidate {
                    kind,
                    id: n.id,
                    title: n.title.clone(),
                    text: n.content.text.clone(),
                })
                .collect(),
            ItemKind::Journal => graph
                .journals
                .values()
                .map(|s| &s.journal)
                .filter(|j| j.embedding.is_none())
                .map(|j| EmbeddingCandidate {
                    kind,
                    id: j.id,
                    title: j.title.clone(),
                    text: j.description.clone(),
                })
                .collect(),
        };
        Ok(candidates
            .into_iter()
            .filter(|c| !c.title.trim().is_empty() || !c.text.trim().is_empty())
            .take(limit)
            .collect())
    }

    async fn vector_query(
        &self,
        kind: ItemKind,
        owner: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let graph = self.graph.read().await;
        let rows: Vec<(Uuid, &str, &str, &Option<Vec<f32>>)> = match kind {
            ItemKind::Note => graph
                .notes_of(owner)
                .map(|n| (n.id, n.title.as_str(), n.content.text.as_str(), &n.embedding))
                .collect(),
            ItemKind::Journal => graph
                .journals
                .values()
                .filter(|s| s.owner == owner)
                .map(|s| &s.journal)
                .map(|j| (j.id, j.title.as_str(), j.description.as_str(), &j.embedding))
                .collect(),
        };

        let mut hits: Vec<VectorHit> = rows
            .into_iter()
            .filter_map(|(id, title, text, embedding)| {
                let score = cosine_similarity(vector, embedding.as_deref()?)?;
                Some(VectorHit {
                    kind,
                    id,
                    title: title.to_string(),
                    text: text.to_string(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

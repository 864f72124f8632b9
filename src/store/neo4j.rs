//! Content store backed by Neo4j, spoken to through the HTTP transactional Cypher endpoint.
//!
//! Graph shape:
//! `(:Note)-[:CREATED_BY]->(:User)`, `(:Journal)-[:OWNED_BY]->(:User)`,
//! `(:Note)-[:BELONGS_TO]->(:Journal)`, `(:Note)-[:HAS_TAG]->(:Tag)`.
//! Timestamps are RFC 3339 strings in UTC, which sort lexicographically.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::codec::{decode_content, decode_template, encode_content, encode_template};
use super::{ContentStore, EmbeddingCandidate, StoreError, VectorHit};
use crate::config::StoreSettings;
use crate::models::{normalize_tags, ItemKind, Journal, Note};

const NOTE_PROJECTION: &str = "n {.id, .title, .content, .contentText, .createdAt, .updatedAt, \
     .journalId, .embedding, tags: [(n)-[:HAS_TAG]->(t:Tag) | t.name]}";

const JOURNAL_PROJECTION: &str =
    "j {.id, .title, .description, .template, .noteCount, .createdAt, .updatedAt, .embedding}";

struct Statement {
    statement: String,
    parameters: Value,
}

impl Statement {
    fn new(statement: impl Into<String>, parameters: Value) -> Self {
        Self {
            statement: statement.into(),
            parameters,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    #[serde(default)]
    message: String,
}

type Rows = Vec<Vec<Value>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteRow {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_text: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    journal_id: Option<String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    tags: Vec<String>,
}

impl TryFrom<NoteRow> for Note {
    type Error = StoreError;

    fn try_from(row: NoteRow) -> Result<Self, Self::Error> {
        let mut content = decode_content(row.content.as_deref().unwrap_or_default());
        if let Some(text) = row.content_text {
            content.text = text;
        }
        Ok(Note {
            id: parse_id(&row.id)?,
            title: row.title.unwrap_or_default(),
            content,
            tags: normalize_tags(row.tags),
            created_at: parse_time(row.created_at.as_deref()),
            updated_at: parse_time(row.updated_at.as_deref()),
            journal_id: row.journal_id.as_deref().map(parse_id).transpose()?,
            embedding: row.embedding,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalRow {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    note_count: Option<i64>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl TryFrom<JournalRow> for Journal {
    type Error = StoreError;

    fn try_from(row: JournalRow) -> Result<Self, Self::Error> {
        Ok(Journal {
            id: parse_id(&row.id)?,
            title: row.title.unwrap_or_default(),
            description: row.description.unwrap_or_default(),
            template: decode_template(row.template.as_deref().unwrap_or_default()),
            note_count: row.note_count.unwrap_or(0).max(0) as u64,
            created_at: parse_time(row.created_at.as_deref()),
            updated_at: parse_time(row.updated_at.as_deref()),
            embedding: row.embedding,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Backend(format!("bad id {raw:?}: {e}")))
}

fn parse_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn first_column<T: for<'de> Deserialize<'de>>(rows: Rows) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .filter_map(|row| row.into_iter().next())
        .map(|value| serde_json::from_value(value).map_err(StoreError::backend))
        .collect()
}

fn map_tx_errors(errors: Vec<TxError>) -> StoreError {
    let summary = errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    if errors
        .iter()
        .any(|e| e.code.contains("ConstraintValidationFailed"))
    {
        StoreError::Conflict(summary)
    } else {
        StoreError::Backend(summary)
    }
}

/// Cypher expression for the primary text of a node bound to `var`.
fn text_expr(kind: ItemKind, var: &str) -> String {
    match kind {
        ItemKind::Note => format!("coalesce({var}.contentText, {var}.content, '')"),
        ItemKind::Journal => format!("coalesce({var}.description, '')"),
    }
}

/// Two columns holding a node's text: the plain form and, for notes, the encoded
/// `content` that older nodes carry without a `contentText`.
fn text_columns(kind: ItemKind, var: &str) -> String {
    match kind {
        ItemKind::Note => format!("{var}.contentText, {var}.content"),
        ItemKind::Journal => format!("coalesce({var}.description, ''), null"),
    }
}

/// Plain text wins as stored. The encoded form is only decoded when no plain text exists.
fn primary_text(plain: Option<String>, encoded: Option<String>) -> String {
    match plain {
        Some(text) => text,
        None => encoded
            .map(|raw| decode_content(&raw).text)
            .unwrap_or_default(),
    }
}

/// Ranks only the owner's nodes, so other users' items never crowd out the top `k`.
fn vector_statement(kind: ItemKind) -> String {
    format!(
        "MATCH (node:{label})-[:{rel}]->(:User {{username: $owner}}) \
         WHERE node.embedding IS NOT NULL AND size(node.embedding) = size($vector) \
         WITH node, vector.similarity.cosine(node.embedding, $vector) AS score \
         RETURN node.id, coalesce(node.title, ''), {text}, score \
         ORDER BY score DESC LIMIT $k",
        label = kind.label(),
        rel = owner_rel(kind),
        text = text_columns(kind, "node"),
    )
}

fn owner_rel(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Note => "CREATED_BY",
        ItemKind::Journal => "OWNED_BY",
    }
}

fn index_name(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Note => "note_embedding",
        ItemKind::Journal => "journal_embedding",
    }
}

fn note_parameters(owner: &str, note: &Note) -> Value {
    json!({
        "owner": owner,
        "id": note.id.to_string(),
        "title": note.title,
        "content": encode_content(&note.content),
        "text": note.content.text,
        "createdAt": format_time(&note.created_at),
        "updatedAt": format_time(&note.updated_at),
        "tags": note.tags.iter().collect::<Vec<_>>(),
        "embedding": note.embedding,
    })
}

fn journal_parameters(owner: &str, journal: &Journal) -> Value {
    json!({
        "owner": owner,
        "id": journal.id.to_string(),
        "title": journal.title,
        "description": journal.description,
        "template": encode_template(&journal.template),
        "createdAt": format_time(&journal.created_at),
        "updatedAt": format_time(&journal.updated_at),
        "embedding": journal.embedding,
    })
}

pub struct Neo4jStore {
    client: Client,
    endpoint: String,
    user: String,
    password: String,
}

impl Neo4jStore {
    pub fn new(settings: &StoreSettings) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!(
                "{}/db/{}/tx/commit",
                settings.neo4j_url.trim_end_matches('/'),
                settings.neo4j_database
            ),
            user: settings.neo4j_user.clone(),
            password: settings.neo4j_password.clone(),
        }
    }

    /// Declares uniqueness constraints and one cosine vector index per embeddable label.
    pub async fn ensure_schema(&self, dimension: usize) -> Result<(), StoreError> {
        let mut statements = vec![
            "CREATE CONSTRAINT user_username IF NOT EXISTS FOR (u:User) REQUIRE u.username IS UNIQUE"
                .to_string(),
            "CREATE CONSTRAINT note_id IF NOT EXISTS FOR (n:Note) REQUIRE n.id IS UNIQUE".to_string(),
            "CREATE CONSTRAINT journal_id IF NOT EXISTS FOR (j:Journal) REQUIRE j.id IS UNIQUE"
                .to_string(),
            "CREATE CONSTRAINT tag_name IF NOT EXISTS FOR (t:Tag) REQUIRE t.name IS UNIQUE".to_string(),
        ];
        for kind in [ItemKind::Note, ItemKind::Journal] {
            statements.push(format!(
                "CREATE VECTOR INDEX {} IF NOT EXISTS FOR (x:{}) ON (x.embedding) \
                 OPTIONS {{indexConfig: {{`vector.dimensions`: {}, `vector.similarity_function`: 'cosine'}}}}",
                index_name(kind),
                kind.label(),
                dimension
            ));
        }

        // schema changes each get their own transaction
        for statement in statements {
            self.run(&statement, json!({})).await?;
        }
        tracing::info!("Neo4j schema ensured (vector dimension {})", dimension);
        Ok(())
    }

    async fn run_batch(&self, statements: Vec<Statement>) -> Result<Vec<Rows>, StoreError> {
        let body = json!({
            "statements": statements
                .iter()
                .map(|s| json!({
                    "statement": s.statement,
                    "parameters": s.parameters,
                    "resultDataContents": ["row"],
                }))
                .collect::<Vec<_>>(),
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.user.is_empty() {
            req = req.basic_auth(&self.user, Some(&self.password));
        }

        let response = req.send().await.map_err(StoreError::backend)?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "Neo4j request failed: {} - {}",
                status, error_text
            )));
        }

        let tx: TxResponse = response.json().await.map_err(StoreError::backend)?;
        if !tx.errors.is_empty() {
            return Err(map_tx_errors(tx.errors));
        }

        Ok(tx
            .results
            .into_iter()
            .map(|result| result.data.into_iter().map(|d| d.row).collect())
            .collect())
    }

    async fn run(&self, statement: &str, parameters: Value) -> Result<Rows, StoreError> {
        let mut results = self
            .run_batch(vec![Statement::new(statement, parameters)])
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Runs a write that returns one row per touched node; no rows means the target is absent.
    async fn run_touching(&self, statement: &str, parameters: Value) -> Result<(), StoreError> {
        if self.run(statement, parameters).await?.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn query_notes(&self, statement: &str, parameters: Value) -> Result<Vec<Note>, StoreError> {
        let rows = self.run(statement, parameters).await?;
        first_column::<NoteRow>(rows)?
            .into_iter()
            .map(Note::try_from)
            .collect()
    }

    async fn query_journals(
        &self,
        statement: &str,
        parameters: Value,
    ) -> Result<Vec<Journal>, StoreError> {
        let rows = self.run(statement, parameters).await?;
        first_column::<JournalRow>(rows)?
            .into_iter()
            .map(Journal::try_from)
            .collect()
    }
}

#[async_trait]
impl ContentStore for Neo4jStore {
    async fn create_note(&self, owner: &str, note: &Note) -> Result<(), StoreError> {
        self.run(
            "MERGE (u:User {username: $owner}) \
             CREATE (n:Note {id: $id, title: $title, content: $content, contentText: $text, \
                             createdAt: $createdAt, updatedAt: $updatedAt}) \
             SET n.embedding = $embedding \
             CREATE (n)-[:CREATED_BY]->(u) \
             FOREACH (tag IN $tags | MERGE (t:Tag {name: tag}) MERGE (n)-[:HAS_TAG]->(t))",
            note_parameters(owner, note),
        )
        .await?;
        Ok(())
    }

    async fn get_note(&self, owner: &str, id: Uuid) -> Result<Option<Note>, StoreError> {
        let statement = format!(
            "MATCH (n:Note {{id: $id}})-[:CREATED_BY]->(:User {{username: $owner}}) \
             RETURN {NOTE_PROJECTION}"
        );
        let notes = self
            .query_notes(&statement, json!({"owner": owner, "id": id.to_string()}))
            .await?;
        Ok(notes.into_iter().next())
    }

    async fn list_notes(&self, owner: &str) -> Result<Vec<Note>, StoreError> {
        let statement = format!(
            "MATCH (n:Note)-[:CREATED_BY]->(:User {{username: $owner}}) \
             RETURN {NOTE_PROJECTION} ORDER BY n.updatedAt DESC"
        );
        self.query_notes(&statement, json!({"owner": owner})).await
    }

    async fn update_note(&self, owner: &str, note: &Note) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (n:Note {id: $id})-[:CREATED_BY]->(:User {username: $owner}) \
             SET n.title = $title, n.content = $content, n.contentText = $text, \
                 n.updatedAt = $updatedAt, n.embedding = $embedding \
             WITH n \
             OPTIONAL MATCH (n)-[r:HAS_TAG]->(:Tag) \
             DELETE r \
             WITH DISTINCT n \
             FOREACH (tag IN $tags | MERGE (t:Tag {name: tag}) MERGE (n)-[:HAS_TAG]->(t)) \
             RETURN n.id",
            note_parameters(owner, note),
        )
        .await
    }

    async fn delete_note(&self, owner: &str, id: Uuid) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (n:Note {id: $id})-[:CREATED_BY]->(:User {username: $owner}) \
             WITH n, n.id AS id \
             DETACH DELETE n \
             RETURN id",
            json!({"owner": owner, "id": id.to_string()}),
        )
        .await
    }

    async fn find_notes_containing(
        &self,
        owner: &str,
        needle: &str,
    ) -> Result<Vec<Note>, StoreError> {
        let statement = format!(
            "MATCH (n:Note)-[:CREATED_BY]->(:User {{username: $owner}}) \
             WHERE toLower(coalesce(n.title, '')) CONTAINS $needle \
                OR toLower({}) CONTAINS $needle \
             RETURN {NOTE_PROJECTION} ORDER BY n.updatedAt DESC",
            text_expr(ItemKind::Note, "n")
        );
        self.query_notes(
            &statement,
            json!({"owner": owner, "needle": needle.to_lowercase()}),
        )
        .await
    }

    async fn find_notes_tagged(
        &self,
        owner: &str,
        tags: &[String],
    ) -> Result<Vec<Note>, StoreError> {
        let wanted: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        let statement = format!(
            "MATCH (n:Note)-[:CREATED_BY]->(:User {{username: $owner}}) \
             WHERE any(tag IN [(n)-[:HAS_TAG]->(t:Tag) | toLower(t.name)] WHERE tag IN $tags) \
             RETURN {NOTE_PROJECTION} ORDER BY n.updatedAt DESC"
        );
        self.query_notes(&statement, json!({"owner": owner, "tags": wanted}))
            .await
    }

    async fn list_tags(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .run(
                "MATCH (:User {username: $owner})<-[:CREATED_BY]-(:Note)-[:HAS_TAG]->(t:Tag) \
                 RETURN DISTINCT t.name AS name ORDER BY name",
                json!({"owner": owner}),
            )
            .await?;
        first_column(rows)
    }

    async fn create_journal(&self, owner: &str, journal: &Journal) -> Result<(), StoreError> {
        self.run(
            "MERGE (u:User {username: $owner}) \
             CREATE (j:Journal {id: $id, title: $title, description: $description, \
                                template: $template, noteCount: 0, \
                                createdAt: $createdAt, updatedAt: $updatedAt}) \
             SET j.embedding = $embedding \
             CREATE (j)-[:OWNED_BY]->(u)",
            journal_parameters(owner, journal),
        )
        .await?;
        Ok(())
    }

    async fn get_journal(&self, owner: &str, id: Uuid) -> Result<Option<Journal>, StoreError> {
        let statement = format!(
            "MATCH (j:Journal {{id: $id}})-[:OWNED_BY]->(:User {{username: $owner}}) \
             RETURN {JOURNAL_PROJECTION}"
        );
        let journals = self
            .query_journals(&statement, json!({"owner": owner, "id": id.to_string()}))
            .await?;
        Ok(journals.into_iter().next())
    }

    async fn list_journals(&self, owner: &str) -> Result<Vec<Journal>, StoreError> {
        let statement = format!(
            "MATCH (j:Journal)-[:OWNED_BY]->(:User {{username: $owner}}) \
             RETURN {JOURNAL_PROJECTION} ORDER BY j.createdAt DESC"
        );
        self.query_journals(&statement, json!({"owner": owner})).await
    }

    async fn update_journal(&self, owner: &str, journal: &Journal) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (j:Journal {id: $id})-[:OWNED_BY]->(:User {username: $owner}) \
             SET j.title = $title, j.description = $description, j.template = $template, \
                 j.updatedAt = $updatedAt, j.embedding = $embedding \
             RETURN j.id",
            journal_parameters(owner, journal),
        )
        .await
    }

    async fn delete_journal(&self, owner: &str, id: Uuid) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (j:Journal {id: $id})-[:OWNED_BY]->(:User {username: $owner}) \
             OPTIONAL MATCH (n:Note {journalId: $id}) \
             SET n.journalId = null \
             WITH DISTINCT j, j.id AS id \
             DETACH DELETE j \
             RETURN id",
            json!({"owner": owner, "id": id.to_string()}),
        )
        .await
    }

    async fn journal_notes(&self, owner: &str, journal_id: Uuid) -> Result<Vec<Note>, StoreError> {
        let statement = format!(
            "MATCH (n:Note)-[:BELONGS_TO]->(:Journal {{id: $journal}})-[:OWNED_BY]->(:User {{username: $owner}}) \
             RETURN {NOTE_PROJECTION} ORDER BY n.updatedAt DESC"
        );
        self.query_notes(
            &statement,
            json!({"owner": owner, "journal": journal_id.to_string()}),
        )
        .await
    }

    async fn journal_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = self.run("MATCH (j:Journal) RETURN j.id", json!({})).await?;
        first_column::<String>(rows)?
            .iter()
            .map(|raw| parse_id(raw))
            .collect()
    }

    async fn link_note(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (n:Note {id: $note}), (j:Journal {id: $journal}) \
             MERGE (n)-[:BELONGS_TO]->(j) \
             SET n.journalId = $journal \
             RETURN n.id",
            json!({"note": note_id.to_string(), "journal": journal_id.to_string()}),
        )
        .await
    }

    async fn unlink_note(&self, note_id: Uuid, journal_id: Uuid) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (n:Note {id: $note}) \
             OPTIONAL MATCH (n)-[r:BELONGS_TO]->(:Journal {id: $journal}) \
             DELETE r \
             WITH DISTINCT n \
             SET n.journalId = CASE WHEN n.journalId = $journal THEN null ELSE n.journalId END \
             RETURN n.id",
            json!({"note": note_id.to_string(), "journal": journal_id.to_string()}),
        )
        .await
    }

    async fn adjust_note_count(&self, journal_id: Uuid, delta: i64) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (j:Journal {id: $journal}) \
             WITH j, coalesce(j.noteCount, 0) + $delta AS next \
             SET j.noteCount = CASE WHEN next < 0 THEN 0 ELSE next END \
             RETURN j.noteCount",
            json!({"journal": journal_id.to_string(), "delta": delta}),
        )
        .await
    }

    async fn count_linked_notes(&self, journal_id: Uuid) -> Result<u64, StoreError> {
        let rows = self
            .run(
                "MATCH (j:Journal {id: $journal}) \
                 RETURN size([(n:Note)-[:BELONGS_TO]->(j) | n])",
                json!({"journal": journal_id.to_string()}),
            )
            .await?;
        first_column::<u64>(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    async fn set_note_count(&self, journal_id: Uuid, count: u64) -> Result<(), StoreError> {
        self.run_touching(
            "MATCH (j:Journal {id: $journal}) SET j.noteCount = $count RETURN j.id",
            json!({"journal": journal_id.to_string(), "count": count}),
        )
        .await
    }

    async fn set_embedding(
        &self,
        kind: ItemKind,
        id: Uuid,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        let statement = format!(
            "MATCH (x:{} {{id: $id}}) SET x.embedding = $embedding RETURN x.id",
            kind.label()
        );
        self.run_touching(&statement, json!({"id": id.to_string(), "embedding": vector}))
            .await
    }

    async fn missing_embeddings(
        &self,
        kind: ItemKind,
        limit: usize,
    ) -> Result<Vec<EmbeddingCandidate>, StoreError> {
        let text = text_expr(kind, "x");
        let statement = format!(
            "MATCH (x:{label}) \
             WHERE x.embedding IS NULL \
               AND trim(coalesce(x.title, '') + ' ' + {text}) <> '' \
             RETURN x.id, coalesce(x.title, ''), {columns} \
             LIMIT $limit",
            label = kind.label(),
            columns = text_columns(kind, "x"),
        );
        let rows = self.run(&statement, json!({"limit": limit})).await?;

        rows.into_iter()
            .map(|row| {
                let (id, title, plain, encoded): (String, String, Option<String>, Option<String>) =
                    serde_json::from_value(Value::Array(row)).map_err(StoreError::backend)?;
                Ok(EmbeddingCandidate {
                    kind,
                    id: parse_id(&id)?,
                    title,
                    text: primary_text(plain, encoded),
                })
            })
            .collect()
    }

    async fn vector_query(
        &self,
        kind: ItemKind,
        owner: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let rows = self
            .run(
                &vector_statement(kind),
                json!({"vector": vector, "owner": owner, "k": k}),
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let (id, title, plain, encoded, score): (
                    String,
                    String,
                    Option<String>,
                    Option<String>,
                    f64,
                ) = serde_json::from_value(Value::Array(row)).map_err(StoreError::backend)?;
                Ok(VectorHit {
                    kind,
                    id: parse_id(&id)?,
                    title,
                    text: primary_text(plain, encoded),
                    score,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> bool {
        match self.run("RETURN 1", json!({})).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Neo4j health check failed: {}", e);
                false
            }
        }
    }
}

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{AdminUser, AuthUser};
use crate::error::AppError;
use crate::generation::AskRequest;
use crate::models::{
    AskParams, DeleteJournalParams, EmbedParams, EmbeddingAck, ItemKind, Journal, JournalCreate,
    JournalUpdate, KeywordsRequest, KeywordsResponse, LogQuery, LogResponse, Note, NoteCreate,
    NoteUpdate, SearchParams, SearchResponse, StreamEvent, SummarizeRequest, SummaryResponse,
    TagList, TemplateRequest, TemplateResponse,
};
use crate::rag::maintenance::{BackfillReport, BackfillStatus};
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, AppError>;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/notes", get(list_notes).post(create_note))
        .route("/api/notes/summarize", post(summarize_note))
        .route("/api/notes/keywords", post(extract_keywords))
        .route("/api/notes/template", post(note_template))
        .route("/api/notes/:id", get(get_note).put(update_note).delete(delete_note))
        .route("/api/notes/:id/embedding", post(embed_note))
        .route("/api/journals", get(list_journals).post(create_journal))
        .route(
            "/api/journals/:id",
            get(get_journal).put(update_journal).delete(delete_journal),
        )
        .route("/api/journals/:id/notes", get(journal_notes))
        .route("/api/journals/:id/embedding", post(embed_journal))
        .route("/api/tags", get(list_tags))
        .route("/api/search", get(search_lexical))
        .route("/api/search/semantic", get(search_semantic))
        .route("/api/search/tags", get(search_tags))
        .route("/api/query-stream", get(query_stream))
        .route("/api/admin/embeddings/backfill", post(run_backfill))
        .route("/api/admin/embeddings/status", get(backfill_status))
        .route("/api/admin/journals/repair", post(repair_journals))
        .route("/api/admin/logs", get(query_logs))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.store.health_check().await;
    let generation = state.gateway.chat().health_check().await;

    Json(json!({
        "status": if store && generation { "healthy" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "store": store,
            "generation": generation,
        }
    }))
}

// Notes

async fn list_notes(State(state): State<Arc<AppState>>, user: AuthUser) -> ApiResult<Vec<Note>> {
    Ok(Json(state.notes.list_notes(&user.username).await?))
}

async fn get_note(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Note> {
    Ok(Json(state.notes.get_note(&user.username, id).await?))
}

async fn create_note(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<NoteCreate>,
) -> Result<(StatusCode, Json<Note>), AppError> {
    let note = state.notes.create_note(&user.username, req).await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn update_note(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NoteUpdate>,
) -> ApiResult<Note> {
    Ok(Json(state.notes.update_note(&user.username, id, req).await?))
}

async fn delete_note(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.notes.delete_note(&user.username, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn embed_note(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<EmbedParams>,
) -> ApiResult<EmbeddingAck> {
    Ok(Json(state.notes.embed_note(&user.username, id, params.force).await?))
}

async fn list_tags(State(state): State<Arc<AppState>>, user: AuthUser) -> ApiResult<TagList> {
    let tags = state.notes.list_tags(&user.username).await?;
    Ok(Json(TagList { tags }))
}

// Journals

async fn list_journals(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Vec<Journal>> {
    Ok(Json(state.notes.list_journals(&user.username).await?))
}

async fn get_journal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Journal> {
    Ok(Json(state.notes.get_journal(&user.username, id).await?))
}

async fn create_journal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<JournalCreate>,
) -> Result<(StatusCode, Json<Journal>), AppError> {
    let journal = state.notes.create_journal(&user.username, req).await?;
    Ok((StatusCode::CREATED, Json(journal)))
}

async fn update_journal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<JournalUpdate>,
) -> ApiResult<Journal> {
    Ok(Json(state.notes.update_journal(&user.username, id, req).await?))
}

async fn delete_journal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteJournalParams>,
) -> Result<StatusCode, AppError> {
    state
        .notes
        .delete_journal(&user.username, id, params.delete_notes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn journal_notes(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Note>> {
    Ok(Json(state.notes.journal_notes(&user.username, id).await?))
}

async fn embed_journal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<EmbedParams>,
) -> ApiResult<EmbeddingAck> {
    Ok(Json(
        state
            .notes
            .embed_journal(&user.username, id, params.force)
            .await?,
    ))
}

// Assistant helpers

async fn summarize_note(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<SummarizeRequest>,
) -> ApiResult<SummaryResponse> {
    Ok(Json(
        state
            .assist
            .summarize(&user.username, req.note_id, req.max_length)
            .await?,
    ))
}

async fn extract_keywords(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<KeywordsRequest>,
) -> ApiResult<KeywordsResponse> {
    Ok(Json(
        state
            .assist
            .keywords(&user.username, req.note_id, req.apply)
            .await?,
    ))
}

async fn note_template(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Json(req): Json<TemplateRequest>,
) -> Json<TemplateResponse> {
    Json(state.assist.template(&req.note_type, &req.details))
}

// Search

async fn search_lexical(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<SearchParams>,
) -> Json<SearchResponse> {
    let query = params.query.unwrap_or_default();
    Json(state.search.lexical(&user.username, &query).await)
}

async fn search_semantic(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResponse> {
    let query = params.query.unwrap_or_default();
    Ok(Json(state.search.semantic(&user.username, &query).await?))
}

async fn search_tags(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<SearchParams>,
) -> Json<SearchResponse> {
    let tags = params.tags.or(params.query).unwrap_or_default();
    Json(state.search.by_tags(&user.username, &tags).await)
}

// Ask

fn to_sse(event: StreamEvent) -> Event {
    match Event::default().event(event.name()).json_data(&event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::error!("Failed to encode {} event: {}", event.name(), e);
            Event::default().event("error").data(e.to_string())
        }
    }
}

async fn query_stream(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<AskParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("Ask from {} (rag: {})", user.username, params.rag);
    let events = state.gateway.ask(AskRequest {
        owner: user.username,
        question: params.text,
        system_prompt: params.system_prompt,
        rag: params.rag,
    });

    Sse::new(events.map(|event| Ok(to_sse(event)))).keep_alive(KeepAlive::default())
}

// Admin

async fn run_backfill(
    State(state): State<Arc<AppState>>,
    admin: AdminUser,
) -> ApiResult<BackfillReport> {
    tracing::info!("Embedding back-fill requested by {}", admin.username);
    let report = state
        .maintenance
        .backfill(&[ItemKind::Note, ItemKind::Journal], |_| {})
        .await?;
    Ok(Json(report))
}

async fn backfill_status(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
) -> Json<BackfillStatus> {
    Json(state.maintenance.status().await)
}

async fn repair_journals(
    State(state): State<Arc<AppState>>,
    admin: AdminUser,
) -> ApiResult<Value> {
    tracing::info!("noteCount repair requested by {}", admin.username);
    let journals = state.notes.repair_note_counts().await?;
    Ok(Json(json!({ "journals": journals })))
}

async fn query_logs(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogResponse> {
    let logger = state.logger.as_ref().ok_or(AppError::NotFound)?;
    let response = logger.query_logs(&query).await.map_err(|e| {
        tracing::error!("Query logs error: {}", e);
        AppError::internal(e)
    })?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_digest;
    use crate::config::{Settings, TokenEntry};
    use crate::store::MemoryStore;
    use crate::testing::{HashEmbedder, ScriptedChat};
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tower::ServiceExt;

    const ALICE: &str = "alice-token";
    const BOB: &str = "bob-token";
    const ROOT: &str = "root-token";

    fn app_with(chat: ScriptedChat) -> Router {
        let mut settings = Settings::default();
        settings.auth.tokens = [("alice", ALICE, false), ("bob", BOB, false), ("root", ROOT, true)]
            .into_iter()
            .map(|(username, token, admin)| TokenEntry {
                sha256: token_digest(token),
                username: username.to_string(),
                admin,
            })
            .collect();
        let state = AppState::new(
            &settings,
            Arc::new(MemoryStore::new()),
            Arc::new(HashEmbedder::new()),
            Arc::new(chat),
            None,
        );
        router(Arc::new(state))
    }

    fn app() -> Router {
        app_with(ScriptedChat::replying(&["Hi", " there"], None))
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    async fn create_note(app: &Router, token: &str, title: &str, text: &str) -> Value {
        let resp = send(
            app,
            request(
                "POST",
                "/api/notes",
                Some(token),
                Some(json!({"title": title, "content": {"text": text}, "tags": ["work"]})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let resp = send(&app(), request("GET", "/api/health", None, None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["services"]["store"], true);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_missing_or_unknown_token_is_unauthorized() {
        let app = app();
        let resp = send(&app, request("GET", "/api/notes", None, None)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = send(&app, request("GET", "/api/notes", Some("guess"), None)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_notes_are_private_to_their_owner() {
        let app = app();
        let note = create_note(&app, ALICE, "Plan", "ship it").await;
        let uri = format!("/api/notes/{}", note["id"].as_str().unwrap());

        let resp = send(&app, request("GET", &uri, Some(ALICE), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["content"]["text"], "ship it");

        let resp = send(&app, request("GET", &uri, Some(BOB), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, request("DELETE", &uri, Some(BOB), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&app, request("GET", "/api/notes", Some(BOB), None)).await;
        assert_eq!(body_json(resp).await, json!([]));
    }

    #[tokio::test]
    async fn test_lexical_search_ranks_title_matches_first() {
        let app = app();
        create_note(&app, ALICE, "Grocery list", "remember the meeting").await;
        create_note(&app, ALICE, "Meeting notes", "").await;
        create_note(&app, BOB, "Meeting with Bob", "").await;

        let resp = send(&app, request("GET", "/api/search?query=meeting", Some(ALICE), None)).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["results"][0]["title"], "Meeting notes");
        assert_eq!(body["results"][0]["score"], 3.0);
        assert_eq!(body["results"][1]["title"], "Grocery list");
        assert_eq!(body["results"][1]["score"], 1.0);
    }

    #[tokio::test]
    async fn test_tag_search_accepts_query_param() {
        let app = app();
        create_note(&app, ALICE, "a", "x").await;
        let resp = send(&app, request("GET", "/api/search/tags?query=Work,home", Some(ALICE), None)).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["results"][0]["score"], 1.0);
    }

    #[tokio::test]
    async fn test_journal_delete_requires_policy_param() {
        let app = app();
        let resp = send(
            &app,
            request("POST", "/api/journals", Some(ALICE), Some(json!({"title": "Diary"}))),
        )
        .await;
        let journal = body_json(resp).await;
        let uri = format!("/api/journals/{}", journal["id"].as_str().unwrap());

        let resp = send(&app, request("DELETE", &uri, Some(ALICE), None)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            request("DELETE", &format!("{}?delete_notes=false", uri), Some(ALICE), None),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_note_count_follows_linkage() {
        let app = app();
        let resp = send(
            &app,
            request("POST", "/api/journals", Some(ALICE), Some(json!({"title": "Diary"}))),
        )
        .await;
        let journal_id = body_json(resp).await["id"].as_str().unwrap().to_string();
        let journal_uri = format!("/api/journals/{}", journal_id);

        let resp = send(
            &app,
            request(
                "POST",
                "/api/notes",
                Some(ALICE),
                Some(json!({"title": "Monday", "journal_id": journal_id})),
            ),
        )
        .await;
        let note_id = body_json(resp).await["id"].as_str().unwrap().to_string();

        let resp = send(&app, request("GET", &journal_uri, Some(ALICE), None)).await;
        assert_eq!(body_json(resp).await["note_count"], 1);

        let resp = send(
            &app,
            request(
                "PUT",
                &format!("/api/notes/{}", note_id),
                Some(ALICE),
                Some(json!({"journal_id": null})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["journal_id"], Value::Null);

        let resp = send(&app, request("GET", &journal_uri, Some(ALICE), None)).await;
        assert_eq!(body_json(resp).await["note_count"], 0);
    }

    #[tokio::test]
    async fn test_admin_routes_reject_regular_users() {
        let app = app();
        let resp = send(&app, request("POST", "/api/admin/embeddings/backfill", Some(ALICE), None)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        create_note(&app, ALICE, "Plan", "ship it").await;
        let resp = send(&app, request("POST", "/api/admin/embeddings/backfill", Some(ROOT), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let report = body_json(resp).await;
        // the note was embedded on create, so nothing is left to fill
        assert_eq!(report["notes"], 0);
        assert_eq!(report["failed"], 0);

        let resp = send(&app, request("POST", "/api/admin/journals/repair", Some(ROOT), None)).await;
        assert_eq!(body_json(resp).await, json!({"journals": 0}));
    }

    #[tokio::test]
    async fn test_logs_are_absent_without_database() {
        let resp = send(&app(), request("GET", "/api/admin/logs", Some(ROOT), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_stream_emits_sse_events_ending_with_close() {
        let app = app();
        let resp = send(&app, request("GET", "/api/query-stream?text=hello", Some(ALICE), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");

        let body = body_text(resp).await;
        assert!(!body.contains("event: sources"));
        let message = body.find("event: message").unwrap();
        let close = body.find("event: close").unwrap();
        assert!(message < close);
        assert!(body.contains(r#"data: {"type":"message","data":"Hi"}"#));
        assert!(body.trim_end().ends_with(r#"data: {"type":"close","data":null}"#));
    }

    #[tokio::test]
    async fn test_query_stream_reports_generation_failure() {
        let app = app_with(ScriptedChat::refusing(crate::generation::GenerationError::Timeout));
        let resp = send(
            &app,
            request("GET", "/api/query-stream?text=hello&rag=true", Some(ALICE), None),
        )
        .await;
        let body = body_text(resp).await;
        assert!(body.contains(r#"data: {"type":"sources","data":[]}"#));
        assert_eq!(body.matches("event: error").count(), 1);
        assert_eq!(body.matches("event: close").count(), 1);
        assert!(!body.contains("event: message"));
    }

    #[tokio::test]
    async fn test_template_route_is_not_taken_for_an_id() {
        let resp = send(
            &app(),
            request(
                "POST",
                "/api/notes/template",
                Some(ALICE),
                Some(json!({"note_type": "Journal"})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["title_suggestion"], "Journal Entry");
    }
}

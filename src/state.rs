use std::sync::Arc;

use anyhow::{Context, Result};

use crate::assist::AssistService;
use crate::auth::TokenRegistry;
use crate::config::{Settings, StoreBackend};
use crate::generation::{ChatBackend, ChatClient, GenerationGateway};
use crate::logger::Logger;
use crate::notes::NoteService;
use crate::rag::{create_provider, ContextAssembler, EmbeddingMaintenance, EmbeddingProvider};
use crate::search::SearchEngine;
use crate::store::{ContentStore, MemoryStore, Neo4jStore};

/// Every collaborator a request handler can reach, built once at startup.
pub struct AppState {
    pub auth: TokenRegistry,
    pub store: Arc<dyn ContentStore>,
    pub maintenance: Arc<EmbeddingMaintenance>,
    pub search: SearchEngine,
    pub gateway: GenerationGateway,
    pub notes: Arc<NoteService>,
    pub assist: AssistService,
    pub logger: Option<Arc<Logger>>,
}

pub async fn build_store(settings: &Settings) -> Result<Arc<dyn ContentStore>> {
    let store: Arc<dyn ContentStore> = match settings.store.backend {
        StoreBackend::Neo4j => {
            tracing::info!("Connecting to Neo4j: {}", settings.store.neo4j_url);
            let store = Neo4jStore::new(&settings.store);
            store
                .ensure_schema(settings.embedding.dimension)
                .await
                .context("declaring the Neo4j schema")?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory content store, nothing will be persisted");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

pub fn build_provider(settings: &Settings) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider = create_provider(&settings.embedding).context("loading the embedding provider")?;
    tracing::info!(
        "Embedding provider ready ({:?}, dimension {})",
        settings.embedding.provider,
        provider.dimension()
    );
    Ok(provider)
}

async fn build_logger(settings: &Settings) -> Option<Arc<Logger>> {
    let url = settings.database_url.as_deref()?;
    let logger = match Logger::new(url).await {
        Ok(logger) => logger,
        Err(e) => {
            tracing::warn!("Ask log database unavailable (continuing without it): {}", e);
            return None;
        }
    };
    if let Err(e) = logger.init_schema().await {
        tracing::warn!("Ask log schema setup failed (continuing without it): {}", e);
        return None;
    }
    tracing::info!("Ask log enabled");
    Some(Arc::new(logger))
}

impl AppState {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let store = build_store(settings).await?;
        let provider = build_provider(settings)?;

        tracing::info!("Generation service: {}", settings.generation.base_url);
        let chat: Arc<dyn ChatBackend> = Arc::new(
            ChatClient::new(&settings.generation).context("building the generation client")?,
        );
        let logger = build_logger(settings).await;

        Ok(Self::new(settings, store, provider, chat, logger))
    }

    /// Wires the services over already-built clients.
    pub fn new(
        settings: &Settings,
        store: Arc<dyn ContentStore>,
        provider: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatBackend>,
        logger: Option<Arc<Logger>>,
    ) -> Self {
        let maintenance = Arc::new(EmbeddingMaintenance::new(
            store.clone(),
            provider.clone(),
            settings.maintenance.batch_size,
        ));
        let search = SearchEngine::new(
            store.clone(),
            maintenance.clone(),
            settings.search.clone(),
        );
        let assembler = Arc::new(ContextAssembler::new(
            store.clone(),
            provider,
            settings.rag.clone(),
        ));
        let gateway = GenerationGateway::new(assembler, chat.clone(), logger.clone());
        let notes = Arc::new(NoteService::new(store.clone(), maintenance.clone()));
        let assist = AssistService::new(notes.clone(), chat);

        let auth = TokenRegistry::from_settings(&settings.auth);
        if auth.is_empty() {
            tracing::warn!("No API tokens configured, every request will be rejected");
        }

        Self {
            auth,
            store,
            maintenance,
            search,
            gateway,
            notes,
            assist,
            logger,
        }
    }
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{EmbeddingBackend, EmbeddingSettings};

const OLLAMA_EMBED_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Provider unreachable or failing. Callers may retry later.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding model error: {0}")]
    Model(String),
}

/// Text → fixed-length vector. Deterministic and free of side effects.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Unavailable("provider returned no vector".into()))
    }
}

fn check_dimensions(
    vectors: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(EmbeddingError::Dimension {
            expected,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}

/// Local ONNX model loaded from a directory of user-supplied files.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    dimension: usize,
}

impl FastEmbedProvider {
    pub fn new(model_dir: &str, dimension: usize) -> Result<Self, EmbeddingError> {
        tracing::info!("Initializing embedding model from {}", model_dir);

        let model_dir = Path::new(model_dir);
        if !model_dir.exists() {
            return Err(EmbeddingError::Model(format!(
                "Model directory not found: {}",
                model_dir.display()
            )));
        }

        let read = |name: &str| {
            std::fs::read(model_dir.join(name))
                .map_err(|e| EmbeddingError::Model(format!("Failed to read {}: {}", name, e)))
        };

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read("model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read("tokenizer.json")?,
                config_file: read("config.json")?,
                special_tokens_map_file: read("special_tokens_map.json")?,
                tokenizer_config_file: read("tokenizer_config.json")?,
            },
        };

        let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
            .map_err(|e| EmbeddingError::Model(format!("Failed to initialize embedding model: {}", e)))?;

        tracing::info!("Embedding model initialized successfully");
        Ok(Self {
            model: Arc::new(model),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        // inference is CPU bound
        let vectors = tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        check_dimensions(vectors, self.dimension)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Calls `POST {url}/api/embed` on an Ollama instance.
pub struct OllamaEmbedder {
    client: Client,
    url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(url: &str, model: &str, dimension: usize) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(OLLAMA_EMBED_TIMEOUT_SECS))
            .build()
            .map_err(|e| EmbeddingError::Model(e.to_string()))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EmbeddingError::Unavailable(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Unavailable(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("Invalid Ollama response: {}", e)))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Unavailable(format!(
                "Ollama returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        check_dimensions(parsed.embeddings, self.dimension)
    }
}

pub fn create_provider(
    settings: &EmbeddingSettings,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider: Arc<dyn EmbeddingProvider> = match settings.provider {
        EmbeddingBackend::FastEmbed => {
            Arc::new(FastEmbedProvider::new(&settings.model_dir, settings.dimension)?)
        }
        EmbeddingBackend::Ollama => Arc::new(OllamaEmbedder::new(
            &settings.ollama_url,
            &settings.model,
            settings.dimension,
        )?),
    };
    Ok(provider)
}

use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "scribe";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub embedding: EmbeddingSettings,
    pub generation: GenerationSettings,
    pub search: SearchSettings,
    pub rag: RagSettings,
    pub maintenance: MaintenanceSettings,
    pub auth: AuthSettings,
    /// Postgres URL for the ask audit log. Logging is off when unset.
    pub database_url: Option<String>,
}

impl Settings {
    /// Reads `.env`, then the optional config file (`SCRIBE_CONFIG` or `scribe.toml`),
    /// then `SCRIBE__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let file = std::env::var("SCRIBE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&file)
    }

    pub fn load_from(file: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("SCRIBE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8585".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Neo4j,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub neo4j_url: String,
    pub neo4j_database: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Neo4j,
            neo4j_url: "http://localhost:7474".to_string(),
            neo4j_database: "neo4j".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "password".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    FastEmbed,
    Ollama,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingBackend,
    /// Directory holding model.onnx and the tokenizer files for the local model.
    pub model_dir: String,
    pub ollama_url: String,
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::FastEmbed,
            model_dir: "/app/models/bge-small-en-v1.5".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatApi {
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub api: ChatApi,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            api: ChatApi::OpenAi,
            base_url: "http://localhost:4000".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub min_query_chars: usize,
    pub semantic_threshold: f64,
    pub semantic_limit: usize,
    pub lexical_title_score: f64,
    pub lexical_content_score: f64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            min_query_chars: 2,
            semantic_threshold: 0.2,
            semantic_limit: 20,
            lexical_title_score: 3.0,
            lexical_content_score: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    pub note_candidates: usize,
    pub journal_candidates: usize,
    pub similarity_threshold: f64,
    pub max_notes: usize,
    pub max_journals: usize,
    pub max_context_chars: usize,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            note_candidates: 5,
            journal_candidates: 3,
            similarity_threshold: 0.7,
            max_notes: 3,
            max_journals: 2,
            max_context_chars: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub batch_size: usize,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthSettings {
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    /// Hex SHA-256 digest of the bearer token.
    pub sha256: String,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let settings = Settings::default();
        assert_eq!(settings.server.bind, "0.0.0.0:8585");
        assert_eq!(settings.search.semantic_threshold, 0.2);
        assert_eq!(settings.search.semantic_limit, 20);
        assert_eq!(settings.rag.similarity_threshold, 0.7);
        assert_eq!(settings.rag.max_notes, 3);
        assert_eq!(settings.rag.max_journals, 2);
        assert_eq!(settings.maintenance.batch_size, 100);
        assert_eq!(settings.generation.timeout_secs, 60);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("/nonexistent/scribe-config").unwrap();
        assert_eq!(settings.rag.note_candidates, 5);
        assert_eq!(settings.rag.journal_candidates, 3);
    }

    #[test]
    fn test_backend_names_deserialize_lowercase() {
        let backend: StoreBackend = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(backend, StoreBackend::Memory);
        let api: ChatApi = serde_json::from_str("\"ollama\"").unwrap();
        assert_eq!(api, ChatApi::Ollama);
        let provider: EmbeddingBackend = serde_json::from_str("\"fastembed\"").unwrap();
        assert_eq!(provider, EmbeddingBackend::FastEmbed);
    }
}

pub mod context;
pub mod embeddings;
pub mod maintenance;

pub use self::context::{ContextAssembler, RagContext};
pub use self::embeddings::{create_provider, EmbeddingError, EmbeddingProvider};
pub use self::maintenance::{BackfillReport, EmbedTarget, EmbeddingMaintenance, MaintenanceError};

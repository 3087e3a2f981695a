use kb_core::KbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Core(#[from] KbError),
    #[error("capability error: {0}")]
    Capability(#[from] anyhow::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("document {0} not found")]
    DocumentNotFound(String),
    #[error("knowledge base {0} not found")]
    KnowledgebaseNotFound(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("invalid upload {name}: {reason}")]
    InvalidUpload { name: String, reason: String },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, RagError>;

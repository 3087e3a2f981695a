use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("parser {parser} failed on {name}: {reason}")]
    Parser {
        parser: &'static str,
        name: String,
        reason: String,
    },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KbError>;

impl From<anyhow::Error> for KbError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}

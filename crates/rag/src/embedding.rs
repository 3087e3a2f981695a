use std::env;

use anyhow::Result;
use kb_core::{count_tokens, HashEmbedder, HashEmbedderConfig};
use kb_llm::{EmbeddingModel, Embeddings};

#[derive(Clone)]
pub struct HashEmbeddingModel {
    name: String,
    embedder: HashEmbedder,
}

impl HashEmbeddingModel {
    pub fn new(name: impl Into<String>, config: HashEmbedderConfig) -> Self {
        Self {
            name: name.into(),
            embedder: HashEmbedder::new(config),
        }
    }

    pub fn from_env() -> Self {
        let dimensions = env::var("KB_HASH_EMBED_DIMENSIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(64);
        let name = env::var("KB_EMBEDDING_MODEL").unwrap_or_else(|_| "hash".to_string());
        Self::new(
            name,
            HashEmbedderConfig {
                dimensions,
                seed: 1337,
            },
        )
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }
}

impl Default for HashEmbeddingModel {
    fn default() -> Self {
        Self::new("hash", HashEmbedderConfig::default())
    }
}

impl EmbeddingModel for HashEmbeddingModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn encode(&self, texts: &[String]) -> Result<Embeddings> {
        let mut tokens = 0u64;
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            tokens += count_tokens(text)? as u64;
            vectors.push(self.embedder.embed_text(text));
        }
        Ok(Embeddings { vectors, tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_returns_one_vector_per_text() {
        let model = HashEmbeddingModel::new(
            "hash-16",
            HashEmbedderConfig {
                dimensions: 16,
                seed: 7,
            },
        );
        let out = model
            .encode(&["first text".to_string(), "second".to_string()])
            .unwrap();
        assert_eq!(out.vectors.len(), 2);
        assert!(out.vectors.iter().all(|v| v.len() == 16));
        assert!(out.tokens >= 3);
        assert_eq!(model.model_name(), "hash-16");
    }

    #[test]
    fn empty_input_costs_nothing() {
        let out = HashEmbeddingModel::default().encode(&[]).unwrap();
        assert!(out.vectors.is_empty());
        assert_eq!(out.tokens, 0);
    }
}

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::parser::ParsedChunk;
use crate::stats::count_tokens;

pub const MIND_MAP_KIND: &str = "mind_map";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    #[serde(default)]
    pub token_count: usize,
    #[serde(default)]
    pub img_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

impl ChunkRecord {
    pub fn new(doc_id: &str, chunk_index: usize, text: String) -> Result<Self> {
        let token_count = count_tokens(&text)?;
        Ok(Self {
            chunk_id: chunk_id(&text, doc_id),
            doc_id: doc_id.to_string(),
            chunk_index,
            text,
            token_count,
            img_id: None,
            kind: None,
            image: None,
        })
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// Turns parser output into indexed chunk records with content-derived ids.
pub fn build_chunks(doc_id: &str, parsed: Vec<ParsedChunk>) -> Result<Vec<ChunkRecord>> {
    let mut records = Vec::with_capacity(parsed.len());
    for chunk in parsed {
        if chunk.text.trim().is_empty() && chunk.image.is_none() {
            continue;
        }
        let mut record = ChunkRecord::new(doc_id, records.len(), chunk.text)?;
        record.image = chunk.image;
        records.push(record);
    }
    Ok(records)
}

/// Stable id over `content || doc_id`; identical inputs always yield the same id.
pub fn chunk_id(content: &str, doc_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(doc_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Splits `text` at any delimiter character and greedily merges the pieces
/// into chunks of roughly `chunk_token_num` tokens.
pub fn naive_merge(text: &str, chunk_token_num: usize, delimiter: &str) -> Result<Vec<String>> {
    let limit = chunk_token_num.max(1);
    let mut chunks: Vec<String> = Vec::new();
    let mut tokens: Vec<usize> = Vec::new();
    for section in split_sections(text, delimiter) {
        if section.trim().is_empty() {
            continue;
        }
        let section_tokens = count_tokens(section)?;
        match (chunks.last_mut(), tokens.last_mut()) {
            (Some(current), Some(current_tokens)) if *current_tokens <= limit => {
                current.push_str(section);
                *current_tokens += section_tokens;
            }
            _ => {
                chunks.push(section.to_string());
                tokens.push(section_tokens);
            }
        }
    }
    Ok(chunks
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect())
}

fn split_sections<'a>(text: &'a str, delimiter: &str) -> Vec<&'a str> {
    let mut sections = Vec::new();
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        if delimiter.contains(ch) {
            let end = idx + ch.len_utf8();
            sections.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sections.push(&text[start..]);
    }
    sections
}

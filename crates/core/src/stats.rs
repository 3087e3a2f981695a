use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::error::{KbError, Result};

static TOKENIZER: Lazy<std::result::Result<CoreBPE, String>> =
    Lazy::new(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()));

pub fn count_tokens(text: &str) -> Result<usize> {
    let bpe = TOKENIZER
        .as_ref()
        .map_err(|e| KbError::Tokenizer(e.clone()))?;
    Ok(bpe.encode_with_special_tokens(text).len())
}

/// Pre-call estimate used for quota admission: two tokens per whitespace word.
pub fn estimate_tokens<S: AsRef<str>>(texts: &[S]) -> u64 {
    texts
        .iter()
        .map(|t| t.as_ref().split_whitespace().count() as u64)
        .sum::<u64>()
        * 2
}

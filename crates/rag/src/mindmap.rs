use anyhow::{anyhow, Result};
use kb_llm::{LlmRequest, CONTEXT_END, CONTEXT_START};
use serde_json::Value;

use crate::metered::{is_quota_exceeded, MeteredChat};

pub const MIN_MIND_MAP_LEN: usize = 32;

const MIND_MAP_PROMPT: &str = "Build a mind map of the CONTEXT as a JSON object. \
Keys are topics and values are nested objects or arrays of sub-topics. \
Return only JSON.";

pub struct MindMapExtractor<'a> {
    chat: &'a MeteredChat,
}

impl<'a> MindMapExtractor<'a> {
    pub fn new(chat: &'a MeteredChat) -> Self {
        Self { chat }
    }

    pub fn extract(&self, texts: &[String]) -> Result<String> {
        if texts.iter().all(|t| t.trim().is_empty()) {
            return Err(anyhow!("no text to summarise"));
        }
        let prompt = format!("{CONTEXT_START}\n{}\n{CONTEXT_END}", texts.join("\n"));
        let response = self
            .chat
            .chat(&LlmRequest::user(prompt).with_system(MIND_MAP_PROMPT))?;
        if is_quota_exceeded(&response.content) {
            return Err(anyhow!("chat quota exhausted"));
        }
        parse_mind_map(&response.content)
    }
}

pub fn parse_mind_map(raw: &str) -> Result<String> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)?;
    if !value.is_object() {
        return Err(anyhow!("mind map is not a JSON object"));
    }
    let rendered = serde_json::to_string_pretty(&value)?;
    if rendered.len() < MIN_MIND_MAP_LEN {
        return Err(anyhow!("mind map too small ({} chars)", rendered.len()));
    }
    Ok(rendered)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

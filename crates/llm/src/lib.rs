use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub history: Vec<ChatMessage>,
}

impl LlmRequest {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            system: None,
            history: vec![ChatMessage {
                role: Role::User,
                content: content.into(),
            }],
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Every text the model will read, system prompt first.
    pub fn input_texts(&self) -> Vec<&str> {
        self.system
            .as_deref()
            .into_iter()
            .chain(self.history.iter().map(|m| m.content.as_str()))
            .collect()
    }

    pub fn last_user(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub tokens: u64,
}

pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;
    fn chat(&self, req: &LlmRequest) -> Result<LlmResponse>;
}

pub trait EmbeddingModel: Send + Sync {
    fn model_name(&self) -> &str;
    fn encode(&self, texts: &[String]) -> Result<Embeddings>;
}

pub const MIND_MAP_MARKER: &str = "mind map";
pub const CONTEXT_START: &str = "=== CONTEXT START ===";
pub const CONTEXT_END: &str = "=== CONTEXT END ===";

/// Offline chat model with deterministic output; token usage is counted in
/// whitespace words.
#[derive(Debug, Clone)]
pub struct LocalChat {
    model: String,
}

impl LocalChat {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for LocalChat {
    fn default() -> Self {
        Self::new("local")
    }
}

impl ChatModel for LocalChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let content = synthesize_local_response(req);
        let prompt_tokens = req
            .input_texts()
            .iter()
            .map(|t| t.split_whitespace().count() as u32)
            .sum();
        let completion_tokens = content.split_whitespace().count() as u32;
        Ok(LlmResponse {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}

fn synthesize_local_response(req: &LlmRequest) -> String {
    let user = req.last_user().unwrap_or_default();
    let wants_mind_map = req
        .input_texts()
        .iter()
        .any(|t| t.to_lowercase().contains(MIND_MAP_MARKER));
    if wants_mind_map {
        let context = extract_context_block(user, CONTEXT_START, CONTEXT_END);
        return outline_json(&context).to_string();
    }
    summarize_text(user, 40)
}

/// First line becomes the root; up to eight following lines become branches.
fn outline_json(context: &str) -> Value {
    let mut lines = context
        .lines()
        .map(|line| summarize_text(line, 8))
        .filter(|line| !line.is_empty());
    let Some(root) = lines.next() else {
        return json!({});
    };
    let branches: Map<String, Value> = lines.take(8).map(|l| (l, json!([]))).collect();
    let mut outline = Map::new();
    outline.insert(root, Value::Object(branches));
    Value::Object(outline)
}

fn extract_context_block(text: &str, start_marker: &str, stop_marker: &str) -> String {
    if let Some(start_idx) = text.find(start_marker) {
        let after = &text[start_idx + start_marker.len()..];
        if let Some(end_idx) = after.find(stop_marker) {
            return after[..end_idx].trim().to_string();
        }
        return after.trim().to_string();
    }
    text.trim().to_string()
}

fn summarize_text(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

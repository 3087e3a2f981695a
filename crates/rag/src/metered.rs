use std::sync::Arc;

use anyhow::Result;
use kb_core::estimate_tokens;
use kb_llm::{ChatModel, EmbeddingModel, Embeddings, LlmRequest, LlmResponse};
use tracing::{debug, warn};

use crate::principal::{Principal, ResourceClass};
use crate::quota::{Admission, QuotaDenial, UsageLedger};

pub const QUOTA_EXCEEDED_MESSAGE: &str =
    "**ERROR**: Token quota exceeded. Ask an administrator to raise your limit or wait for the next reset.";

pub fn is_quota_exceeded(content: &str) -> bool {
    content == QUOTA_EXCEEDED_MESSAGE
}

#[derive(Debug)]
pub enum Metered<T> {
    Served(T),
    Denied(QuotaDenial),
}

#[derive(Clone)]
struct Meter {
    ledger: Arc<UsageLedger>,
    principal: Principal,
    class: ResourceClass,
    name: String,
}

impl Meter {
    // Ledger failures never block a model call.
    fn admit(&self, estimated: u64) -> Option<QuotaDenial> {
        match self
            .ledger
            .check(&self.principal, self.class, &self.name, estimated)
        {
            Ok(Admission::Allow) => None,
            Ok(Admission::Deny(denial)) => Some(denial),
            Err(err) => {
                warn!(user = %self.principal.id, class = %self.class, error = %err, "quota check failed, allowing call");
                None
            }
        }
    }

    fn record(&self, used: u64) {
        if used == 0 {
            return;
        }
        if !self
            .ledger
            .commit(&self.principal, self.class, &self.name, used)
        {
            warn!(user = %self.principal.id, class = %self.class, used, "usage not recorded");
        }
    }
}

#[derive(Clone)]
pub struct MeteredEmbedding {
    model: Arc<dyn EmbeddingModel>,
    meter: Meter,
}

impl MeteredEmbedding {
    pub fn new(model: Arc<dyn EmbeddingModel>, ledger: Arc<UsageLedger>, principal: Principal) -> Self {
        let name = model.model_name().to_string();
        Self {
            model,
            meter: Meter {
                ledger,
                principal,
                class: ResourceClass::Embedding,
                name,
            },
        }
    }

    pub fn model_name(&self) -> &str {
        &self.meter.name
    }

    pub fn encode(&self, texts: &[String]) -> Result<Metered<Embeddings>> {
        if let Some(denial) = self.meter.admit(estimate_tokens(texts)) {
            return Ok(Metered::Denied(denial));
        }
        let embeddings = self.model.encode(texts)?;
        debug!(model = %self.meter.name, texts = texts.len(), tokens = embeddings.tokens, "embedded batch");
        self.meter.record(embeddings.tokens);
        Ok(Metered::Served(embeddings))
    }
}

#[derive(Clone)]
pub struct MeteredChat {
    model: Arc<dyn ChatModel>,
    meter: Meter,
}

impl MeteredChat {
    pub fn new(model: Arc<dyn ChatModel>, ledger: Arc<UsageLedger>, principal: Principal) -> Self {
        let name = model.model_name().to_string();
        Self {
            model,
            meter: Meter {
                ledger,
                principal,
                class: ResourceClass::Chat,
                name,
            },
        }
    }

    pub fn model_name(&self) -> &str {
        &self.meter.name
    }

    pub fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        if self.meter.admit(estimate_tokens(&req.input_texts())).is_some() {
            return Ok(LlmResponse {
                content: QUOTA_EXCEEDED_MESSAGE.to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
            });
        }
        let response = self.model.chat(req)?;
        self.meter.record(u64::from(response.total_tokens()));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::embedding::HashEmbeddingModel;
    use crate::period::{FixedClock, ResetInterval};
    use chrono::NaiveDate;
    use kb_llm::LocalChat;
    use tempfile::tempdir;

    fn ledger(limit: u64) -> (tempfile::TempDir, Arc<UsageLedger>) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()));
        let ledger = UsageLedger::open(
            dir.path().join("usage.sqlite"),
            QuotaConfig {
                enabled: true,
                normal_user_limit: limit,
                reset_interval: ResetInterval::Monthly,
            },
            clock,
        )
        .unwrap();
        (dir, Arc::new(ledger))
    }

    #[test]
    fn embedding_usage_is_committed() {
        let (_dir, ledger) = ledger(0);
        let metered = MeteredEmbedding::new(
            Arc::new(HashEmbeddingModel::default()),
            ledger.clone(),
            Principal::user("u1"),
        );
        let out = match metered.encode(&["hello world".to_string()]).unwrap() {
            Metered::Served(out) => out,
            Metered::Denied(d) => panic!("unexpected denial: {d}"),
        };
        let record = ledger
            .record("u1", ResourceClass::Embedding, "hash")
            .unwrap()
            .unwrap();
        assert_eq!(record.consumed_units, out.tokens);
    }

    #[test]
    fn embedding_is_denied_over_limit() {
        let (_dir, ledger) = ledger(3);
        let metered = MeteredEmbedding::new(
            Arc::new(HashEmbeddingModel::default()),
            ledger.clone(),
            Principal::user("u1"),
        );
        let result = metered
            .encode(&["one two three four five".to_string()])
            .unwrap();
        match result {
            Metered::Denied(denial) => {
                assert_eq!(denial.limit, 3);
                assert_eq!(denial.requested, 10);
            }
            Metered::Served(_) => panic!("expected denial"),
        }
        let record = ledger
            .record("u1", ResourceClass::Embedding, "hash")
            .unwrap()
            .unwrap();
        assert_eq!(record.consumed_units, 0);
    }

    #[test]
    fn denied_chat_returns_sentinel() {
        let (_dir, ledger) = ledger(2);
        let chat = MeteredChat::new(Arc::new(LocalChat::default()), ledger, Principal::user("u2"));
        let response = chat.chat(&LlmRequest::user("please summarise this")).unwrap();
        assert!(is_quota_exceeded(&response.content));
        assert!(response.content.starts_with("**ERROR**"));
        assert_eq!(response.total_tokens(), 0);
    }

    #[test]
    fn chat_commits_total_tokens() {
        let (_dir, ledger) = ledger(0);
        let chat = MeteredChat::new(Arc::new(LocalChat::default()), ledger.clone(), Principal::user("u3"));
        let response = chat.chat(&LlmRequest::user("a b c")).unwrap();
        let record = ledger
            .record("u3", ResourceClass::Chat, "local")
            .unwrap()
            .unwrap();
        assert_eq!(record.consumed_units, u64::from(response.total_tokens()));
    }
}

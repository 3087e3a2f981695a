#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use kb_core::ParserKind;
use kb_index::{MemoryBlobStore, MemoryIndex};
use kb_llm::LocalChat;
use kb_rag::{
    Catalog, FixedClock, HashEmbeddingModel, IngestConfig, IngestionPipeline, Knowledgebase,
    NewKnowledgebase, QuotaConfig, ResetInterval, UploadService, UsageLedger,
};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub catalog: Catalog,
    pub ledger: Arc<UsageLedger>,
    pub clock: Arc<FixedClock>,
    pub blobs: Arc<MemoryBlobStore>,
    pub index: Arc<MemoryIndex>,
    pub pipeline: Arc<IngestionPipeline>,
    pub uploads: UploadService,
}

pub fn quota(limit: u64) -> QuotaConfig {
    QuotaConfig {
        enabled: true,
        normal_user_limit: limit,
        reset_interval: ResetInterval::Monthly,
    }
}

impl Harness {
    pub fn new(quota: QuotaConfig, ingest: IngestConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite")).unwrap();
        let clock = Arc::new(FixedClock::new(
            NaiveDate::from_ymd_opt(2024, 4, 15).unwrap(),
        ));
        let ledger = Arc::new(
            UsageLedger::open(dir.path().join("usage.sqlite"), quota, clock.clone()).unwrap(),
        );
        let blobs = Arc::new(MemoryBlobStore::new());
        let index = Arc::new(MemoryIndex::new());
        let pipeline = Arc::new(
            IngestionPipeline::new(
                ingest,
                catalog.clone(),
                blobs.clone(),
                index.clone(),
                ledger.clone(),
                Arc::new(HashEmbeddingModel::default()),
            )
            .with_chat(Arc::new(LocalChat::default())),
        );
        let uploads = UploadService::new(catalog.clone(), blobs.clone(), pipeline.clone());
        Self {
            dir,
            catalog,
            ledger,
            clock,
            blobs,
            index,
            pipeline,
            uploads,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(quota(0), small_ingest())
    }

    pub fn knowledgebase(&self, tenant: &str, name: &str) -> Knowledgebase {
        self.catalog
            .create_knowledgebase(&NewKnowledgebase {
                tenant_id: tenant.to_string(),
                name: name.to_string(),
                embedding_model: "hash".to_string(),
                parser: ParserKind::Naive,
            })
            .unwrap()
    }
}

pub fn small_ingest() -> IngestConfig {
    IngestConfig {
        max_workers: 4,
        embedding_batch_size: 4,
        index_bulk_size: 3,
        chunk_token_num: 64,
        ..IngestConfig::default()
    }
}

/// About `bytes` of plain prose; every sentence is distinct so chunk texts
/// never collide.
pub fn prose(bytes: usize) -> String {
    let mut text = String::new();
    let mut n = 0;
    while text.len() < bytes {
        n += 1;
        text.push_str(&format!(
            "Item {n} of the quarterly budget review covers travel, hiring and tooling costs.\n"
        ));
    }
    text
}

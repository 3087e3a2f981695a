use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use chrono::Local;
use kb_core::{build_chunks, ChunkRecord, ParserKind, ParserSet, MIND_MAP_KIND};
use kb_index::{index_name, BlobStore, DocumentIndex, IndexRecord};
use kb_llm::{ChatModel, EmbeddingModel};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, DocumentRecord, Knowledgebase};
use crate::config::IngestConfig;
use crate::error::{RagError, Result};
use crate::metered::{Metered, MeteredChat, MeteredEmbedding};
use crate::mindmap::MindMapExtractor;
use crate::principal::Principal;
use crate::quota::UsageLedger;

#[derive(Debug, Clone)]
pub struct PendingDocument {
    pub record: DocumentRecord,
    pub bytes: Vec<u8>,
}

impl PendingDocument {
    pub fn new(record: DocumentRecord, bytes: Vec<u8>) -> Self {
        Self { record, bytes }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunks: u64,
    pub tokens: u64,
    pub mind_map: bool,
    pub duration_secs: f64,
}

#[derive(Debug)]
pub struct IngestionJob {
    pub doc_id: String,
    pub kb_id: String,
    pub chunks: Vec<ChunkRecord>,
    pub chunks_emitted: u64,
    pub tokens_emitted: u64,
}

impl IngestionJob {
    fn new(record: &DocumentRecord, chunks: Vec<ChunkRecord>) -> Self {
        Self {
            doc_id: record.id.clone(),
            kb_id: record.kb_id.clone(),
            chunks,
            chunks_emitted: 0,
            tokens_emitted: 0,
        }
    }
}

pub struct IngestionPipeline {
    config: IngestConfig,
    parsers: ParserSet,
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn DocumentIndex>,
    ledger: Arc<UsageLedger>,
    embedder: Arc<dyn EmbeddingModel>,
    chat: Option<Arc<dyn ChatModel>>,
    ensured: Mutex<HashSet<(String, String)>>,
}

impl IngestionPipeline {
    pub fn new(
        config: IngestConfig,
        catalog: Catalog,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn DocumentIndex>,
        ledger: Arc<UsageLedger>,
        embedder: Arc<dyn EmbeddingModel>,
    ) -> Self {
        Self {
            config,
            parsers: ParserSet::builtin(),
            catalog,
            blobs,
            index,
            ledger,
            embedder,
            chat: None,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_parsers(mut self, parsers: ParserSet) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    // Runs every document on a bounded worker pool. Results keep input
    // order and one document's failure never affects another.
    pub fn ingest_batch(
        &self,
        principal: &Principal,
        kb: &Knowledgebase,
        docs: Vec<PendingDocument>,
    ) -> Result<Vec<(String, Result<IngestReport>)>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers.max(1))
            .build()
            .map_err(|e| RagError::Config(format!("failed to build ingest pool: {e}")))?;
        info!(kb_id = %kb.id, documents = docs.len(), workers = self.config.max_workers, "ingesting batch");
        let results = pool.install(|| {
            docs.par_iter()
                .map(|doc| {
                    let outcome = self.ingest_document(principal, kb, doc);
                    if let Err(err) = &outcome {
                        error!(doc_id = %doc.record.id, name = %doc.record.name, error = %err, "ingestion failed");
                    }
                    (doc.record.id.clone(), outcome)
                })
                .collect()
        });
        Ok(results)
    }

    pub fn ingest_document(
        &self,
        principal: &Principal,
        kb: &Knowledgebase,
        doc: &PendingDocument,
    ) -> Result<IngestReport> {
        let started = Instant::now();
        let record = &doc.record;
        let parsed = self.parsers.get(record.parser).chunk(
            &record.name,
            &doc.bytes,
            &self.config.parser_config(),
        )?;
        let mut job = IngestionJob::new(record, build_chunks(&record.id, parsed)?);
        debug!(doc_id = %job.doc_id, parser = %record.parser, chunks = job.chunks.len(), "document chunked");

        self.store_images(&mut job)?;

        let mut mind_map = false;
        if self.config.mind_map && record.parser != ParserKind::Picture && !job.chunks.is_empty() {
            if let Some(chat) = &self.chat {
                mind_map = self.append_mind_map(principal, chat, &mut job);
            }
        }

        let vectors = self.embed(principal, &mut job)?;
        let written = self.write_index(kb, record, &job, vectors)?;

        let duration = started.elapsed().as_secs_f64();
        self.catalog.increment_chunk_num(
            &job.doc_id,
            &job.kb_id,
            job.tokens_emitted,
            job.chunks_emitted,
            duration,
        )?;
        info!(
            doc_id = %job.doc_id,
            chunks = job.chunks_emitted,
            tokens = job.tokens_emitted,
            indexed = written,
            mind_map,
            "document ingested"
        );
        Ok(IngestReport {
            doc_id: job.doc_id,
            chunks: job.chunks_emitted,
            tokens: job.tokens_emitted,
            mind_map,
            duration_secs: duration,
        })
    }

    fn store_images(&self, job: &mut IngestionJob) -> Result<()> {
        for chunk in job.chunks.iter_mut() {
            let Some(image) = chunk.image.take() else {
                continue;
            };
            self.blobs.put(&job.kb_id, &chunk.chunk_id, &image)?;
            chunk.img_id = Some(format!("{}-{}", job.kb_id, chunk.chunk_id));
        }
        Ok(())
    }

    fn append_mind_map(
        &self,
        principal: &Principal,
        chat: &Arc<dyn ChatModel>,
        job: &mut IngestionJob,
    ) -> bool {
        let metered = MeteredChat::new(chat.clone(), self.ledger.clone(), principal.clone());
        let texts: Vec<String> = job.chunks.iter().map(|c| c.text.clone()).collect();
        let summary = match MindMapExtractor::new(&metered).extract(&texts) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(doc_id = %job.doc_id, error = %err, "mind map skipped");
                return false;
            }
        };
        match ChunkRecord::new(&job.doc_id, job.chunks.len(), summary) {
            Ok(mut chunk) => {
                chunk.kind = Some(MIND_MAP_KIND.to_string());
                job.chunks.push(chunk);
                true
            }
            Err(err) => {
                warn!(doc_id = %job.doc_id, error = %err, "mind map skipped");
                false
            }
        }
    }

    fn embed(&self, principal: &Principal, job: &mut IngestionJob) -> Result<Vec<Vec<f32>>> {
        let metered = MeteredEmbedding::new(self.embedder.clone(), self.ledger.clone(), principal.clone());
        let texts: Vec<String> = job.chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embedding_batch_size.max(1)) {
            let embeddings = match metered.encode(batch)? {
                Metered::Served(embeddings) => embeddings,
                Metered::Denied(denial) => {
                    warn!(doc_id = %job.doc_id, user = %principal.id, %denial, "embedding denied");
                    return Err(RagError::QuotaExceeded(denial.to_string()));
                }
            };
            if embeddings.vectors.len() != batch.len() {
                return Err(RagError::Capability(anyhow!(
                    "{} returned {} vectors for {} texts",
                    metered.model_name(),
                    embeddings.vectors.len(),
                    batch.len()
                )));
            }
            let expected = vectors
                .first()
                .or_else(|| embeddings.vectors.first())
                .map(Vec::len)
                .unwrap_or_default();
            if let Some(bad) = embeddings.vectors.iter().find(|v| v.len() != expected) {
                return Err(RagError::Dimension {
                    expected,
                    got: bad.len(),
                });
            }
            job.chunks_emitted += batch.len() as u64;
            job.tokens_emitted += embeddings.tokens;
            vectors.extend(embeddings.vectors);
        }
        Ok(vectors)
    }

    fn write_index(
        &self,
        kb: &Knowledgebase,
        record: &DocumentRecord,
        job: &IngestionJob,
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize> {
        let Some(dim) = vectors.first().map(Vec::len) else {
            return Ok(0);
        };
        let index = index_name(&kb.tenant_id);
        self.ensure_index(&index, &job.kb_id, dim)?;
        let create_time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let records: Vec<IndexRecord> = job
            .chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexRecord {
                id: chunk.chunk_id.clone(),
                doc_id: job.doc_id.clone(),
                kb_id: job.kb_id.clone(),
                docnm: record.name.clone(),
                content: chunk.text.clone(),
                token_count: chunk.token_count,
                img_id: chunk.img_id.clone(),
                knowledge_graph_kwd: chunk.kind.clone(),
                vector,
                create_time: create_time.clone(),
                ..IndexRecord::default()
            })
            .collect();
        let mut written = 0usize;
        for bulk in records.chunks(self.config.index_bulk_size.max(1)) {
            written += self.index.upsert(bulk, &index, &job.kb_id)?;
        }
        Ok(written)
    }

    fn ensure_index(&self, index: &str, container: &str, dim: usize) -> Result<()> {
        let key = (index.to_string(), container.to_string());
        let mut ensured = self.ensured.lock();
        if ensured.contains(&key) {
            return Ok(());
        }
        if !self.index.index_exists(index, container)? {
            self.index.create_index(index, container, dim)?;
            info!(index, container, dim, "search index created");
        }
        ensured.insert(key);
        Ok(())
    }
}

mod common;

use std::sync::Arc;

use anyhow::anyhow;
use common::{prose, quota, small_ingest, Harness};
use kb_core::{chunk_id, FileType, KbError, ParserKind, MIND_MAP_KIND};
use kb_index::{index_name, BlobStore, MemoryBlobStore, MemoryIndex};
use kb_llm::{ChatModel, LlmRequest, LlmResponse};
use kb_rag::{
    DocumentInsert, HashEmbeddingModel, IngestConfig, IngestionPipeline, Knowledgebase,
    PendingDocument, Principal, RagError, ResourceClass, Visibility,
};

fn stored(h: &Harness, kb: &Knowledgebase, name: &str, bytes: &[u8]) -> PendingDocument {
    let file_type = FileType::from_filename(name);
    let record = h
        .catalog
        .insert_document(&DocumentInsert {
            kb_id: kb.id.clone(),
            name: name.to_string(),
            location: name.to_string(),
            size: bytes.len() as u64,
            file_type,
            parser: ParserKind::for_file(file_type, name, ParserKind::Naive),
            created_by: "writer".to_string(),
            visibility: Visibility::Private,
            fingerprint: kb_rag::fingerprint(bytes).to_string(),
        })
        .unwrap();
    PendingDocument::new(record, bytes.to_vec())
}

#[test]
fn text_document_is_chunked_embedded_and_indexed() {
    let h = Harness::with_defaults();
    let kb = h.knowledgebase("tenant-a", "notes");
    let doc = stored(&h, &kb, "notes.txt", prose(1500).as_bytes());
    let writer = Principal::user("writer");

    let report = h.pipeline.ingest_document(&writer, &kb, &doc).unwrap();
    assert!(report.chunks > 1);
    assert!(report.mind_map);

    let records = h.index.records(&index_name("tenant-a"), &kb.id);
    assert_eq!(records.len() as u64, report.chunks);
    let summaries: Vec<_> = records
        .iter()
        .filter(|r| r.knowledge_graph_kwd.as_deref() == Some(MIND_MAP_KIND))
        .collect();
    assert_eq!(summaries.len(), 1);
    for record in &records {
        assert_eq!(record.id, chunk_id(&record.content, &doc.record.id));
        assert_eq!(record.docnm, "notes.txt");
    }

    let stored = h.catalog.get_document(&doc.record.id).unwrap().unwrap();
    assert_eq!(stored.chunk_num, report.chunks);
    assert_eq!(stored.token_num, report.tokens);
    let kb_now = h.catalog.get_knowledgebase(&kb.id).unwrap().unwrap();
    assert_eq!(kb_now.chunk_num, report.chunks);
}

#[test]
fn reingesting_produces_identical_chunk_ids() {
    let h = Harness::new(quota(0), IngestConfig { mind_map: false, ..small_ingest() });
    let kb = h.knowledgebase("tenant-a", "notes");
    let doc = stored(&h, &kb, "notes.txt", prose(800).as_bytes());
    let writer = Principal::user("writer");
    h.pipeline.ingest_document(&writer, &kb, &doc).unwrap();
    let first: Vec<String> = h
        .index
        .records(&index_name("tenant-a"), &kb.id)
        .into_iter()
        .map(|r| r.id)
        .collect();
    h.pipeline.ingest_document(&writer, &kb, &doc).unwrap();
    let second: Vec<String> = h
        .index
        .records(&index_name("tenant-a"), &kb.id)
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(first, second);
}

#[test]
fn picture_payload_goes_to_blob_store() {
    let h = Harness::with_defaults();
    let kb = h.knowledgebase("tenant-a", "photos");
    let image = vec![0x89, b'P', b'N', b'G', 1, 2, 3];
    let doc = stored(&h, &kb, "site_plan.png", &image);
    let report = h
        .pipeline
        .ingest_document(&Principal::user("writer"), &kb, &doc)
        .unwrap();
    assert!(!report.mind_map);
    assert_eq!(report.chunks, 1);

    let records = h.index.records(&index_name("tenant-a"), &kb.id);
    let record = &records[0];
    assert_eq!(record.img_id.as_deref(), Some(format!("{}-{}", kb.id, record.id).as_str()));
    assert_eq!(h.blobs.get(&kb.id, &record.id).unwrap(), image);
}

#[test]
fn embedding_quota_denial_aborts_the_document() {
    let h = Harness::new(quota(20), IngestConfig { mind_map: false, ..small_ingest() });
    let kb = h.knowledgebase("tenant-a", "notes");
    let doc = stored(&h, &kb, "notes.txt", prose(1500).as_bytes());
    let err = h
        .pipeline
        .ingest_document(&Principal::user("writer"), &kb, &doc)
        .unwrap_err();
    assert!(matches!(err, RagError::QuotaExceeded(_)));
    assert!(err.to_string().contains("limit 20"));

    let stored = h.catalog.get_document(&doc.record.id).unwrap().unwrap();
    assert_eq!(stored.chunk_num, 0);
    assert!(h.index.records(&index_name("tenant-a"), &kb.id).is_empty());
}

struct BrokenChat;

impl ChatModel for BrokenChat {
    fn model_name(&self) -> &str {
        "broken"
    }

    fn chat(&self, _req: &LlmRequest) -> anyhow::Result<LlmResponse> {
        Err(anyhow!("upstream unavailable"))
    }
}

#[test]
fn mind_map_failure_is_skipped() {
    let h = Harness::with_defaults();
    let index = Arc::new(MemoryIndex::new());
    let pipeline = IngestionPipeline::new(
        small_ingest(),
        h.catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
        index.clone(),
        h.ledger.clone(),
        Arc::new(HashEmbeddingModel::default()),
    )
    .with_chat(Arc::new(BrokenChat));
    let kb = h.knowledgebase("tenant-b", "kb");
    let doc = stored(&h, &kb, "memo.txt", prose(300).as_bytes());
    let report = pipeline
        .ingest_document(&Principal::user("writer"), &kb, &doc)
        .unwrap();
    assert!(!report.mind_map);
    let records = index.records(&index_name("tenant-b"), &kb.id);
    assert_eq!(records.len() as u64, report.chunks);
    assert!(records.iter().all(|r| r.knowledge_graph_kwd.is_none()));
}

#[test]
fn missing_document_row_fails_without_touching_the_knowledgebase() {
    let h = Harness::with_defaults();
    let kb = h.knowledgebase("tenant-a", "notes");
    let doc = stored(&h, &kb, "notes.txt", prose(400).as_bytes());
    assert!(h.catalog.delete_document(&doc.record.id).unwrap());

    let err = h
        .pipeline
        .ingest_document(&Principal::user("writer"), &kb, &doc)
        .unwrap_err();
    assert!(matches!(err, RagError::DocumentNotFound(_)));
    let kb_now = h.catalog.get_knowledgebase(&kb.id).unwrap().unwrap();
    assert_eq!((kb_now.chunk_num, kb_now.token_num), (0, 0));
}

#[test]
fn batch_isolates_failures_and_creates_index_once() {
    let h = Harness::with_defaults();
    let kb = h.knowledgebase("tenant-a", "mixed");
    let good_a = stored(&h, &kb, "a.txt", prose(600).as_bytes());
    let good_b = stored(&h, &kb, "b.txt", b"Hiring plan for the second half.\nTwo engineers.");
    let audio = stored(&h, &kb, "talk.mp3", b"ID3\x03\x00");
    let gone = stored(&h, &kb, "gone.txt", b"This row disappears before ingestion.");
    h.catalog.delete_document(&gone.record.id).unwrap();

    let ids: Vec<String> = [&good_a, &good_b, &audio, &gone]
        .iter()
        .map(|d| d.record.id.clone())
        .collect();
    let results = h
        .pipeline
        .ingest_batch(
            &Principal::user("writer"),
            &kb,
            vec![good_a, good_b, audio, gone],
        )
        .unwrap();

    let returned: Vec<String> = results.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(returned, ids);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_ok());
    assert!(matches!(results[2].1, Err(RagError::Core(_))));
    assert!(matches!(results[3].1, Err(RagError::DocumentNotFound(_))));

    let expected: u64 = results
        .iter()
        .take(2)
        .map(|(_, r)| r.as_ref().unwrap().chunks)
        .sum();
    let kb_now = h.catalog.get_knowledgebase(&kb.id).unwrap().unwrap();
    assert_eq!(kb_now.chunk_num, expected);
    assert_eq!(h.index.vector_dim(&index_name("tenant-a"), &kb.id), Some(64));
}

#[test]
fn embedding_usage_is_charged_to_the_uploader() {
    let h = Harness::new(quota(0), IngestConfig { mind_map: false, ..small_ingest() });
    let kb = h.knowledgebase("tenant-a", "notes");
    let doc = stored(&h, &kb, "notes.txt", prose(500).as_bytes());
    let report = h
        .pipeline
        .ingest_document(&Principal::user("writer"), &kb, &doc)
        .unwrap();
    let usage = h
        .ledger
        .record("writer", ResourceClass::Embedding, "hash")
        .unwrap()
        .unwrap();
    assert_eq!(usage.consumed_units, report.tokens);
}

#[test]
fn office_container_is_neither_indexed_nor_charged() {
    let h = Harness::new(quota(1_000_000), small_ingest());
    let kb = h.knowledgebase("tenant-a", "reports");
    let doc = stored(
        &h,
        &kb,
        "report.docx",
        b"PK\x03\x04\x14\x00\x06\x00\x08\x00word/document.xml",
    );
    let err = h
        .pipeline
        .ingest_document(&Principal::user("writer"), &kb, &doc)
        .unwrap_err();
    assert!(matches!(err, RagError::Core(KbError::UnsupportedInput(_))));
    assert!(h.index.records(&index_name("tenant-a"), &kb.id).is_empty());
    assert!(h
        .ledger
        .record("writer", ResourceClass::Embedding, "hash")
        .unwrap()
        .is_none());
}

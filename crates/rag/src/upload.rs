use std::collections::HashMap;
use std::sync::Arc;

use kb_core::{extension, file_stem, thumbnail_png, FileType, ParserKind};
use kb_index::BlobStore;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::{
    new_document_id, Catalog, DocumentInsert, DocumentRecord, Knowledgebase, Visibility,
};
use crate::config::IngestConfig;
use crate::dedup::{fingerprint, DedupDecision, DedupResolver};
use crate::error::{RagError, Result};
use crate::grant::AccessGrantResolver;
use crate::pipeline::{IngestReport, IngestionPipeline, PendingDocument};
use crate::principal::Principal;

pub const MAX_FILENAME_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Ingested {
        name: String,
        doc_id: String,
        report: IngestReport,
    },
    Failed {
        name: String,
        doc_id: String,
        error: String,
    },
    Rejected {
        name: String,
        reason: String,
    },
    Duplicate {
        name: String,
        existing_id: String,
        message: String,
    },
    AccessGranted {
        name: String,
        existing_id: String,
        message: String,
    },
}

impl UploadOutcome {
    pub fn name(&self) -> &str {
        match self {
            UploadOutcome::Ingested { name, .. }
            | UploadOutcome::Failed { name, .. }
            | UploadOutcome::Rejected { name, .. }
            | UploadOutcome::Duplicate { name, .. }
            | UploadOutcome::AccessGranted { name, .. } => name,
        }
    }

    pub fn is_ingested(&self) -> bool {
        matches!(self, UploadOutcome::Ingested { .. })
    }
}

enum Slot {
    Done(UploadOutcome),
    Pending(String),
}

pub struct UploadService {
    config: IngestConfig,
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    dedup: DedupResolver,
    grants: AccessGrantResolver,
    pipeline: Arc<IngestionPipeline>,
}

impl UploadService {
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>, pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            config: pipeline.config().clone(),
            dedup: DedupResolver::new(catalog.clone()),
            grants: AccessGrantResolver::new(catalog.clone()),
            catalog,
            blobs,
            pipeline,
        }
    }

    pub fn upload(
        &self,
        principal: &Principal,
        kb_id: &str,
        files: Vec<UploadFile>,
        visibility: Visibility,
    ) -> Result<Vec<UploadOutcome>> {
        let kb = self
            .catalog
            .get_knowledgebase(kb_id)?
            .ok_or_else(|| RagError::KnowledgebaseNotFound(kb_id.to_string()))?;

        let mut slots = Vec::with_capacity(files.len());
        let mut pending = Vec::new();
        let mut accepted: HashMap<String, String> = HashMap::new();
        for file in files {
            match self.admit(principal, &kb, &file, visibility, &mut accepted) {
                Ok(Admitted::Outcome(outcome)) => slots.push(Slot::Done(outcome)),
                Ok(Admitted::Stored(record)) => {
                    slots.push(Slot::Pending(record.id.clone()));
                    pending.push(PendingDocument::new(record, file.bytes));
                }
                Err(err) => {
                    error!(name = %file.name, kb_id = %kb.id, error = %err, "upload failed");
                    slots.push(Slot::Done(UploadOutcome::Rejected {
                        name: file.name,
                        reason: err.to_string(),
                    }));
                }
            }
        }

        let names: HashMap<String, String> = pending
            .iter()
            .map(|p| (p.record.id.clone(), p.record.name.clone()))
            .collect();
        let mut reports: HashMap<String, std::result::Result<IngestReport, String>> =
            match self.pipeline.ingest_batch(principal, &kb, pending) {
                Ok(results) => results
                    .into_iter()
                    .map(|(doc_id, result)| (doc_id, result.map_err(|e| e.to_string())))
                    .collect(),
                Err(err) => {
                    error!(kb_id = %kb.id, error = %err, "ingest batch did not start");
                    names
                        .keys()
                        .map(|doc_id| (doc_id.clone(), Err(err.to_string())))
                        .collect()
                }
            };

        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Done(outcome) => outcome,
                Slot::Pending(doc_id) => {
                    let name = names.get(&doc_id).cloned().unwrap_or_default();
                    match reports.remove(&doc_id) {
                        Some(Ok(report)) => UploadOutcome::Ingested { name, doc_id, report },
                        Some(Err(error)) => UploadOutcome::Failed { name, doc_id, error },
                        None => UploadOutcome::Failed {
                            name,
                            doc_id,
                            error: "document was not processed".to_string(),
                        },
                    }
                }
            })
            .collect())
    }

    fn admit(
        &self,
        principal: &Principal,
        kb: &Knowledgebase,
        file: &UploadFile,
        visibility: Visibility,
        accepted: &mut HashMap<String, String>,
    ) -> Result<Admitted> {
        let file_type = match self.validate(kb, file) {
            Ok(file_type) => file_type,
            Err(RagError::InvalidUpload { name, reason }) => {
                warn!(name = %name, reason = %reason, "upload rejected");
                return Ok(Admitted::Outcome(UploadOutcome::Rejected { name, reason }));
            }
            Err(err) => return Err(err),
        };

        let digest = fingerprint(&file.bytes);
        if let Some(existing_id) = accepted.get(digest.as_str()) {
            return Ok(Admitted::Outcome(UploadOutcome::Duplicate {
                name: file.name.clone(),
                existing_id: existing_id.clone(),
                message: "identical file appears earlier in this upload".to_string(),
            }));
        }
        let decision = self.dedup.decide(principal, &digest, &kb.id)?;
        let message = decision.message();
        match decision {
            DedupDecision::Allow => {}
            DedupDecision::Deny(existing) => {
                info!(name = %file.name, existing = %existing.id, "duplicate upload denied");
                return Ok(Admitted::Outcome(UploadOutcome::Duplicate {
                    name: file.name.clone(),
                    existing_id: existing.id,
                    message,
                }));
            }
            DedupDecision::GrantAccess(existing) => {
                let outcome = if self.grants.grant(&existing.id, &principal.id) {
                    UploadOutcome::AccessGranted {
                        name: file.name.clone(),
                        existing_id: existing.id,
                        message,
                    }
                } else {
                    UploadOutcome::Rejected {
                        name: file.name.clone(),
                        reason: format!("could not grant access to {}", existing.id),
                    }
                };
                return Ok(Admitted::Outcome(outcome));
            }
        }

        let doc_id = new_document_id();
        let name = self.unique_name(&kb.id, &file.name)?;
        let location = self.free_location(&kb.id, &name)?;
        self.blobs.put(&kb.id, &location, &file.bytes)?;
        let thumbnail = match file_type {
            FileType::Visual => self.store_thumbnail(&kb.id, &doc_id, &file.bytes),
            _ => None,
        };
        let parser = ParserKind::for_file(file_type, &name, kb.parser);
        let insert = DocumentInsert {
            kb_id: kb.id.clone(),
            name,
            location,
            size: file.bytes.len() as u64,
            file_type,
            parser,
            created_by: principal.id.clone(),
            visibility,
            fingerprint: digest.to_string(),
        };
        let record = self
            .catalog
            .insert_document_counted(&doc_id, &insert, thumbnail.as_deref())?;
        accepted.insert(digest.to_string(), record.id.clone());
        info!(doc_id = %record.id, name = %record.name, kb_id = %kb.id, parser = %parser, "upload stored");
        Ok(Admitted::Stored(record))
    }

    pub fn validate(&self, kb: &Knowledgebase, file: &UploadFile) -> Result<FileType> {
        let invalid = |reason: String| RagError::InvalidUpload {
            name: file.name.clone(),
            reason,
        };
        if file.name.len() >= MAX_FILENAME_LEN {
            return Err(invalid(format!("file name must be shorter than {MAX_FILENAME_LEN} bytes")));
        }
        let file_type = FileType::from_filename(&file.name);
        if !file_type.is_supported() {
            return Err(invalid("this type of file is not supported".to_string()));
        }
        let cap = self.config.max_files_per_user;
        if cap > 0 && self.catalog.document_count(&kb.tenant_id)? >= cap {
            return Err(invalid(format!("exceeded the maximum of {cap} files")));
        }
        Ok(file_type)
    }

    fn unique_name(&self, kb_id: &str, name: &str) -> Result<String> {
        if !self.catalog.document_name_exists(kb_id, name)? {
            return Ok(name.to_string());
        }
        let stem = file_stem(name);
        let ext = extension(name);
        let mut n = 1u32;
        loop {
            let candidate = if ext.is_empty() {
                format!("{stem}({n})")
            } else {
                format!("{stem}({n}).{ext}")
            };
            if !self.catalog.document_name_exists(kb_id, &candidate)? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn store_thumbnail(&self, kb_id: &str, doc_id: &str, bytes: &[u8]) -> Option<String> {
        let png = match thumbnail_png(bytes) {
            Ok(png) => png,
            Err(err) => {
                warn!(doc_id, error = %err, "thumbnail skipped");
                return None;
            }
        };
        let key = format!("thumbnail_{doc_id}.png");
        match self.blobs.put(kb_id, &key, &png) {
            Ok(()) => Some(key),
            Err(err) => {
                warn!(doc_id, error = %err, "thumbnail not stored");
                None
            }
        }
    }

    fn free_location(&self, kb_id: &str, name: &str) -> Result<String> {
        let mut location = name.to_string();
        while self.blobs.exists(kb_id, &location)? {
            location.push('_');
        }
        Ok(location)
    }
}

enum Admitted {
    Outcome(UploadOutcome),
    Stored(DocumentRecord),
}

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod grant;
pub mod metered;
pub mod mindmap;
pub mod period;
pub mod pipeline;
pub mod principal;
pub mod quota;
pub mod upload;

pub use catalog::{
    new_document_id, Catalog, DocumentInsert, DocumentRecord, Knowledgebase, NewKnowledgebase,
    Visibility,
};
pub use config::{IngestConfig, KbConfig, QuotaConfig};
pub use dedup::{fingerprint, is_visible, DedupDecision, DedupResolver, DuplicateMatches, Fingerprint};
pub use embedding::HashEmbeddingModel;
pub use error::{RagError, Result};
pub use grant::AccessGrantResolver;
pub use metered::{is_quota_exceeded, Metered, MeteredChat, MeteredEmbedding, QUOTA_EXCEEDED_MESSAGE};
pub use mindmap::{parse_mind_map, MindMapExtractor};
pub use period::{next_reset_date, Clock, FixedClock, ResetInterval, SystemClock};
pub use pipeline::{IngestReport, IngestionJob, IngestionPipeline, PendingDocument};
pub use principal::{Principal, ResourceClass};
pub use quota::{Admission, QuotaDenial, UsageLedger, UsageRecord, UsageStatistics};
pub use upload::{UploadFile, UploadOutcome, UploadService, MAX_FILENAME_LEN};

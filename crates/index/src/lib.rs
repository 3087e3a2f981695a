mod blob;
mod doc_index;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use doc_index::{index_name, DocumentIndex, IndexFilter, IndexRecord, MemoryIndex};

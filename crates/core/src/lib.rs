mod chunk;
mod embedding;
mod error;
mod file_type;
mod parser;
mod stats;
mod thumbnail;

pub use chunk::{build_chunks, chunk_id, naive_merge, ChunkRecord, MIND_MAP_KIND};
pub use embedding::{HashEmbedder, HashEmbedderConfig};
pub use error::{KbError, Result};
pub use file_type::{extension, file_stem, FileType};
pub use parser::{
    AudioParser, ChunkParser, EmailParser, NaiveParser, ParsedChunk, ParserConfig, ParserKind,
    ParserSet, PictureParser, PresentationParser,
};
pub use stats::{count_tokens, estimate_tokens};
pub use thumbnail::{thumbnail_png, THUMBNAIL_SIZE};

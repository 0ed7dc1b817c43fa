//! Chunk storage: repository, reference-counted chunks and the chunk file format

mod chunk;
mod format;
mod purge;
mod reader;
mod repository;
mod writer;

pub use chunk::{Chunk, ChunkInfo, ChunkRef};
pub use format::{
    encode_record, ChunkHeader, CHUNK_HEADER_SIZE, CHUNK_MAGIC, CHUNK_VERSION, MAX_EVENT_NAME_LEN,
    RECORD_BODY_PREFIX, RECORD_FRAME_SIZE,
};
pub use purge::PurgeList;
pub use reader::{read_chunk, ChunkFileReader, ChunkSection, EventRecord};
pub use repository::Repository;
pub use writer::ChunkFileWriter;

/// File extension of chunk files
pub const CHUNK_EXTENSION: &str = "chunk";

/// Upper bound on name collision / directory recreation attempts
pub const MAX_CHUNK_NAME_RETRIES: u32 = 1000;

/// Capacity of the deferred deletion list
pub const PURGE_LIST_CAPACITY: usize = 1000;

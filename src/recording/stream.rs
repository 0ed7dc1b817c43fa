//! Sequential reader over the chunks of a stopped recording

use std::fs::File;
use std::io::{self, Read};

use crate::storage::ChunkRef;

/// Reads a list of chunk files back to back
///
/// Holds a reference to every chunk until dropped, so the files cannot be
/// deleted underneath the reader.
pub struct ChunkStream {
    chunks: Vec<ChunkRef>,
    next: usize,
    current: Option<File>,
}

impl ChunkStream {
    /// Stream over `chunks` in order
    #[must_use]
    pub fn new(chunks: Vec<ChunkRef>) -> Self {
        Self {
            chunks,
            next: 0,
            current: None,
        }
    }

    /// Chunks covered by this stream
    #[must_use]
    pub fn chunks(&self) -> &[ChunkRef] {
        &self.chunks
    }

    /// Total bytes the stream will yield
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.size()).sum()
    }
}

impl Read for ChunkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }

            let Some(chunk) = self.chunks.get(self.next) else {
                return Ok(0);
            };
            self.current = Some(File::open(chunk.path())?);
            self.next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Chunk, PurgeList};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn chunk(dir: &TempDir, purge: &Arc<PurgeList>, name: &str, data: &[u8]) -> ChunkRef {
        let path = dir.path().join(name);
        let chunk = Chunk::create(&path, Arc::clone(purge)).unwrap();
        std::fs::write(&path, data).unwrap();
        chunk.finish(1).unwrap();
        chunk
    }

    #[test]
    fn test_reads_chunks_in_order() {
        let dir = TempDir::new().unwrap();
        let purge = Arc::new(PurgeList::new(4));
        let chunks = vec![
            chunk(&dir, &purge, "a.chunk", b"hello "),
            chunk(&dir, &purge, "b.chunk", b""),
            chunk(&dir, &purge, "c.chunk", b"world"),
        ];

        let mut stream = ChunkStream::new(chunks);
        assert_eq!(stream.total_size(), 11);

        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_stream_keeps_chunks_alive() {
        let dir = TempDir::new().unwrap();
        let purge = Arc::new(PurgeList::new(4));
        let original = chunk(&dir, &purge, "a.chunk", b"data");
        let path = original.path().to_path_buf();

        let stream = ChunkStream::new(vec![original.clone()]);
        drop(original);
        assert!(path.exists());

        drop(stream);
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_stream() {
        let mut stream = ChunkStream::new(Vec::new());
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}

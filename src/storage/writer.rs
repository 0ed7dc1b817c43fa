//! Chunk file writer

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::BytesMut;

use super::format::{encode_record, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::Result;

/// Appends framed records to one chunk file
pub struct ChunkFileWriter {
    path: PathBuf,
    file: BufWriter<File>,
    scratch: BytesMut,
    bytes_written: u64,
    opened_at: Instant,
}

impl ChunkFileWriter {
    /// Open `path` for appending and write the chunk header
    ///
    /// The file is normally created (and its name reserved) by the repository
    /// beforehand; it is created here if missing.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or the header cannot be written
    pub fn create(path: &Path, start_nanos: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut file = BufWriter::new(file);
        file.write_all(ChunkHeader::new(start_nanos).as_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            scratch: BytesMut::with_capacity(4096),
            bytes_written: CHUNK_HEADER_SIZE as u64,
            opened_at: Instant::now(),
        })
    }

    /// Append one event record
    ///
    /// # Errors
    ///
    /// Returns error if the record is invalid or the write fails
    pub fn append(&mut self, timestamp: u64, name: &str, payload: &[u8]) -> Result<()> {
        self.scratch.clear();
        encode_record(&mut self.scratch, timestamp, name, payload)?;
        self.file.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len() as u64;
        Ok(())
    }

    /// Append records already framed elsewhere
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn append_framed(&mut self, framed: &[u8]) -> Result<()> {
        self.file.write_all(framed)?;
        self.bytes_written += framed.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes to the OS
    ///
    /// # Errors
    ///
    /// Returns error if flush fails
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and sync, returning the bytes written
    ///
    /// # Errors
    ///
    /// Returns error if flush or sync fails
    pub fn finish(mut self) -> Result<u64> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.bytes_written)
    }

    /// Path being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written including the header
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Time since the file was opened
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }
}

//! Chunk file reader

use std::path::Path;

use super::format::{
    ChunkHeader, CHUNK_HEADER_SIZE, CHUNK_MAGIC, RECORD_BODY_PREFIX, RECORD_FRAME_SIZE,
};
use crate::{ChunklineError, Result};

/// A single decoded event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Event timestamp (Unix epoch nanoseconds)
    pub timestamp: u64,
    /// Event name
    pub name: String,
    /// Opaque event payload
    pub payload: Vec<u8>,
}

/// One chunk section within a file or dump
#[derive(Debug, Clone)]
pub struct ChunkSection {
    /// Header of the section
    pub header: ChunkHeader,
    /// Records in write order
    pub records: Vec<EventRecord>,
}

/// Reader for chunk files and dumps
pub struct ChunkFileReader {
    data: Vec<u8>,
}

impl ChunkFileReader {
    /// Open a chunk file or a dump of concatenated chunks
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(Self { data })
    }

    /// Wrap bytes already in memory
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Total bytes held by this reader
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the underlying data is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode every chunk section
    ///
    /// # Errors
    ///
    /// Returns error on a malformed header, truncated record or CRC mismatch
    pub fn sections(&self) -> Result<Vec<ChunkSection>> {
        let mut sections = Vec::new();
        let mut offset = 0;

        while offset < self.data.len() {
            let header = ChunkHeader::parse(&self.data[offset..])?;
            offset += CHUNK_HEADER_SIZE;

            let mut records = Vec::new();
            while offset < self.data.len() && !self.data[offset..].starts_with(&CHUNK_MAGIC) {
                let (record, next) = self.decode_record(offset)?;
                records.push(record);
                offset = next;
            }

            sections.push(ChunkSection { header, records });
        }

        Ok(sections)
    }

    /// Decode every record across all sections
    ///
    /// # Errors
    ///
    /// Returns error if any section is malformed
    pub fn records(&self) -> Result<Vec<EventRecord>> {
        Ok(self
            .sections()?
            .into_iter()
            .flat_map(|section| section.records)
            .collect())
    }

    fn decode_record(&self, offset: usize) -> Result<(EventRecord, usize)> {
        let data = &self.data;

        if data.len() < offset + RECORD_FRAME_SIZE {
            return Err(ChunklineError::InvalidFormat(format!(
                "Truncated record frame at offset {offset}"
            )));
        }

        let body_len =
            u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
                as usize;
        let expected = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);

        let body_start = offset + RECORD_FRAME_SIZE;
        let body_end = body_start + body_len;
        if body_len < RECORD_BODY_PREFIX || data.len() < body_end {
            return Err(ChunklineError::InvalidFormat(format!(
                "Truncated record body at offset {offset}"
            )));
        }

        let body = &data[body_start..body_end];
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(ChunklineError::CorruptedData {
                offset: offset as u64,
                expected,
                actual,
            });
        }

        let timestamp = u64::from_le_bytes([
            body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
        ]);
        let name_len = u16::from_le_bytes([body[8], body[9]]) as usize;
        if RECORD_BODY_PREFIX + name_len > body.len() {
            return Err(ChunklineError::InvalidFormat(format!(
                "Event name overruns record at offset {offset}"
            )));
        }

        let name_end = RECORD_BODY_PREFIX + name_len;
        let name = String::from_utf8_lossy(&body[RECORD_BODY_PREFIX..name_end]).to_string();
        let payload = body[name_end..].to_vec();

        Ok((
            EventRecord {
                timestamp,
                name,
                payload,
            },
            body_end,
        ))
    }
}

/// Read and validate every record of a chunk file or dump
///
/// # Errors
///
/// Returns error if the file cannot be read or fails validation
pub fn read_chunk(path: &Path) -> Result<Vec<EventRecord>> {
    ChunkFileReader::open(path)?.records()
}

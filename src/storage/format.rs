//! Chunk file format structures
//!
//! A chunk file is a 64-byte [`ChunkHeader`] followed by framed records:
//!
//! ```text
//! [body_len u32][crc32 u32][timestamp u64][name_len u16][name][payload]
//! ```
//!
//! `body_len` and the CRC cover everything after the CRC field. All integers are
//! little-endian. Several chunk files concatenated back to back (a dump) remain
//! readable because every file starts with the magic bytes.

use bytemuck::{bytes_of, Pod, Zeroable};
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;

use crate::{ChunklineError, Result};

/// Chunk magic bytes: "CHNKLINE"
pub const CHUNK_MAGIC: [u8; 8] = *b"CHNKLINE";

/// Current chunk format version
pub const CHUNK_VERSION: u32 = 1;

/// Chunk header size
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Fixed part of a record frame (`body_len` + crc)
pub const RECORD_FRAME_SIZE: usize = 8;

/// Fixed part of a record body (timestamp + name length)
pub const RECORD_BODY_PREFIX: usize = 10;

/// Maximum event name length in bytes
pub const MAX_EVENT_NAME_LEN: usize = u16::MAX as usize;

/// Chunk file header (64 bytes)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkHeader {
    /// Magic bytes for format identification
    pub magic: [u8; 8],

    /// Format version
    pub version: u32,

    /// CRC32 of header (excluding this field)
    pub header_crc: u32,

    /// Output start timestamp (Unix epoch nanoseconds)
    pub start_nanos: u64,

    /// Process that wrote the chunk
    pub pid: u32,

    /// Padding
    pub flags: u32,

    /// Reserved for future use
    pub reserved: [u8; 32],
}

static_assertions::const_assert_eq!(std::mem::size_of::<ChunkHeader>(), CHUNK_HEADER_SIZE);

impl ChunkHeader {
    /// Create a sealed header for an output starting at `start_nanos`
    #[must_use]
    pub fn new(start_nanos: u64) -> Self {
        let mut header = Self::zeroed();
        header.magic = CHUNK_MAGIC;
        header.version = CHUNK_VERSION;
        header.start_nanos = start_nanos;
        header.pid = std::process::id();
        header.header_crc = header.compute_crc();
        header
    }

    /// Parse and validate a header from the first 64 bytes of `data`
    ///
    /// # Errors
    ///
    /// Returns error if data is short, magic/version mismatch or CRC is wrong
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(ChunklineError::InvalidFormat(
                "Data too small to contain chunk header".to_string(),
            ));
        }

        let header: Self = bytemuck::pod_read_unaligned(&data[..CHUNK_HEADER_SIZE]);

        if header.magic != CHUNK_MAGIC {
            return Err(ChunklineError::InvalidFormat(format!(
                "Invalid magic bytes: expected {:?}, got {:?}",
                CHUNK_MAGIC, header.magic
            )));
        }

        if header.version != CHUNK_VERSION {
            return Err(ChunklineError::InvalidFormat(format!(
                "Unsupported version: {}, expected {}",
                header.version, CHUNK_VERSION
            )));
        }

        let computed = header.compute_crc();
        if computed != header.header_crc {
            return Err(ChunklineError::CorruptedData {
                offset: 0,
                expected: header.header_crc,
                actual: computed,
            });
        }

        Ok(header)
    }

    /// Header bytes as written to disk
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytes_of(self)
    }

    fn compute_crc(&self) -> u32 {
        let bytes = bytes_of(self);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..12]); // magic + version
        hasher.update(&bytes[16..]); // everything after the CRC field
        hasher.finalize()
    }
}

/// Append one framed record to `buf`
///
/// # Errors
///
/// Returns error if the event name is longer than [`MAX_EVENT_NAME_LEN`]
pub fn encode_record(buf: &mut BytesMut, timestamp: u64, name: &str, payload: &[u8]) -> Result<()> {
    if name.len() > MAX_EVENT_NAME_LEN {
        return Err(ChunklineError::InvalidFormat(format!(
            "Event name too long: {} > {MAX_EVENT_NAME_LEN}",
            name.len()
        )));
    }

    let body_len = RECORD_BODY_PREFIX + name.len() + payload.len();
    let body_len = u32::try_from(body_len).map_err(|_| {
        ChunklineError::InvalidFormat(format!("Record too large: {body_len} bytes"))
    })?;

    let mut body = BytesMut::with_capacity(body_len as usize);
    body.put_u64_le(timestamp);
    body.put_u16_le(name.len() as u16);
    body.put_slice(name.as_bytes());
    body.put_slice(payload);

    buf.reserve(RECORD_FRAME_SIZE + body.len());
    buf.put_u32_le(body_len);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);

    Ok(())
}

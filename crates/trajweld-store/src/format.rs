//! On-disk format of a consolidated container (`.twc` file).
//!
//! Layout:
//! - one fixed 40-byte [`ContainerHeader`]
//! - the schema JSON block (`schema_len` bytes, xxh3 recorded in the header)
//! - zero or more variable-size records, back-to-back, no padding
//!
//! Every record is `tag: u8 | payload_len: u32 | payload_xxh3: u64 | payload`.
//! Two tags exist: payload chunks (frame count + projected frame bytes) and
//! manifest entries (one fragment identity string). Torn tails are tolerated
//! during the open-time scan: complete records are preserved and the file is
//! truncated back to the last valid record boundary.

use trajweld_error::{Result, WeldError};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes of a container header (`"TWLD"`).
pub const CONTAINER_MAGIC: [u8; 4] = *b"TWLD";
/// Current container format version.
pub const CONTAINER_VERSION: u32 = 1;
/// Exact byte size of [`ContainerHeader`] on disk.
pub const CONTAINER_HEADER_BYTES: usize = 40;

const HEADER_HASH_INPUT_BYTES: usize = 32;

/// Record tag for a payload chunk: `frame_count: u32` + frame bytes.
pub const TAG_CHUNK: u8 = 1;
/// Record tag for a manifest entry: one UTF-8 fragment identity.
pub const TAG_MANIFEST: u8 = 2;

/// Fixed prefix of every record: tag + payload length + payload xxh3.
pub const RECORD_HEADER_BYTES: usize = 13;

/// Upper bound on a single record payload. Appenders chunk far below this;
/// the scan treats a larger length field as a torn/invalid tail.
pub const MAX_RECORD_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Header stored at the start of each container.
///
/// Layout (40 bytes, little-endian integer fields):
/// - `magic[4]`
/// - `version: u32`
/// - `created_at: u64` (unix seconds)
/// - `schema_len: u64`
/// - `schema_xxh3: u64` (hash of the schema JSON block)
/// - `header_xxh3: u64` (hash of preceding 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Container creation timestamp (unix seconds).
    pub created_at: u64,
    /// Byte length of the schema JSON block that follows the header.
    pub schema_len: u64,
    /// xxh3 of the schema JSON block.
    pub schema_hash: u64,
}

impl ContainerHeader {
    #[must_use]
    pub const fn new(created_at: u64, schema_len: u64, schema_hash: u64) -> Self {
        Self {
            created_at,
            schema_len,
            schema_hash,
        }
    }

    /// First byte offset of the record stream.
    pub fn data_start(&self) -> Result<u64> {
        let header = usize_to_u64(CONTAINER_HEADER_BYTES, "container header size")?;
        header
            .checked_add(self.schema_len)
            .ok_or_else(|| WeldError::ContainerCorrupt {
                detail: format!("schema length overflows data start: {}", self.schema_len),
            })
    }

    /// Encode the header to its exact wire representation.
    #[must_use]
    pub fn encode(&self) -> [u8; CONTAINER_HEADER_BYTES] {
        let mut out = [0_u8; CONTAINER_HEADER_BYTES];
        out[0..4].copy_from_slice(&CONTAINER_MAGIC);
        out[4..8].copy_from_slice(&CONTAINER_VERSION.to_le_bytes());
        out[8..16].copy_from_slice(&self.created_at.to_le_bytes());
        out[16..24].copy_from_slice(&self.schema_len.to_le_bytes());
        out[24..32].copy_from_slice(&self.schema_hash.to_le_bytes());
        let checksum = xxh3_64(&out[..HEADER_HASH_INPUT_BYTES]);
        out[32..40].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Decode and validate a header from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTAINER_HEADER_BYTES {
            return Err(WeldError::ContainerCorrupt {
                detail: format!(
                    "container header too short: expected {CONTAINER_HEADER_BYTES}, got {}",
                    bytes.len()
                ),
            });
        }

        if bytes[0..4] != CONTAINER_MAGIC {
            return Err(WeldError::ContainerCorrupt {
                detail: format!("invalid container magic: {:02X?}", &bytes[0..4]),
            });
        }

        let version = read_u32_at(bytes, 4, "version")?;
        if version != CONTAINER_VERSION {
            return Err(WeldError::ContainerCorrupt {
                detail: format!(
                    "unsupported container version {version}, expected {CONTAINER_VERSION}"
                ),
            });
        }

        let created_at = read_u64_at(bytes, 8, "created_at")?;
        let schema_len = read_u64_at(bytes, 16, "schema_len")?;
        let schema_hash = read_u64_at(bytes, 24, "schema_xxh3")?;
        let stored_checksum = read_u64_at(bytes, 32, "header_xxh3")?;
        let computed_checksum = xxh3_64(&bytes[..HEADER_HASH_INPUT_BYTES]);

        if stored_checksum != computed_checksum {
            return Err(WeldError::ContainerCorrupt {
                detail: format!(
                    "container header checksum mismatch: stored {stored_checksum:#018X}, computed {computed_checksum:#018X}"
                ),
            });
        }

        Ok(Self {
            created_at,
            schema_len,
            schema_hash,
        })
    }
}

/// Encode one record: fixed prefix plus payload, ready to append.
pub fn encode_record(tag: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_RECORD_PAYLOAD_BYTES {
        return Err(WeldError::Internal(format!(
            "record payload of {} bytes exceeds the {MAX_RECORD_PAYLOAD_BYTES} byte limit",
            payload.len()
        )));
    }
    let payload_len = usize_to_u32(payload.len(), "record payload length")?;
    let mut out = Vec::with_capacity(RECORD_HEADER_BYTES + payload.len());
    out.push(tag);
    out.extend_from_slice(&payload_len.to_le_bytes());
    out.extend_from_slice(&xxh3_64(payload).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parsed record prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub tag: u8,
    pub payload_len: u32,
    pub payload_hash: u64,
}

impl RecordHeader {
    /// Decode the fixed prefix. The caller has already bounds-checked
    /// `bytes` to at least [`RECORD_HEADER_BYTES`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let tag = *bytes.first().ok_or_else(|| WeldError::ContainerCorrupt {
            detail: "empty record prefix".to_owned(),
        })?;
        let payload_len = read_u32_at(bytes, 1, "payload_len")?;
        let payload_hash = read_u64_at(bytes, 5, "payload_xxh3")?;
        Ok(Self {
            tag,
            payload_len,
            payload_hash,
        })
    }
}

/// Encode a chunk payload: `frame_count: u32` followed by the frame bytes.
pub fn encode_chunk_payload(frame_count: u32, frames: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + frames.len());
    out.extend_from_slice(&frame_count.to_le_bytes());
    out.extend_from_slice(frames);
    out
}

/// Read the frame count out of a chunk payload.
pub fn decode_chunk_frame_count(payload: &[u8]) -> Result<u32> {
    read_u32_at(payload, 0, "chunk frame_count")
}

// ---------------------------------------------------------------------------
// Field and width helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_u32_at(bytes: &[u8], start: usize, field: &str) -> Result<u32> {
    let end = start
        .checked_add(4)
        .ok_or_else(|| WeldError::ContainerCorrupt {
            detail: format!("overflow while reading field {field}"),
        })?;
    let slice = bytes
        .get(start..end)
        .ok_or_else(|| WeldError::ContainerCorrupt {
            detail: format!(
                "field {field} out of bounds: start={start}, end={end}, len={}",
                bytes.len()
            ),
        })?;
    let array: [u8; 4] = slice.try_into().map_err(|_| WeldError::ContainerCorrupt {
        detail: format!("failed to parse field {field}"),
    })?;
    Ok(u32::from_le_bytes(array))
}

pub(crate) fn read_u64_at(bytes: &[u8], start: usize, field: &str) -> Result<u64> {
    let end = start
        .checked_add(8)
        .ok_or_else(|| WeldError::ContainerCorrupt {
            detail: format!("overflow while reading field {field}"),
        })?;
    let slice = bytes
        .get(start..end)
        .ok_or_else(|| WeldError::ContainerCorrupt {
            detail: format!(
                "field {field} out of bounds: start={start}, end={end}, len={}",
                bytes.len()
            ),
        })?;
    let array: [u8; 8] = slice.try_into().map_err(|_| WeldError::ContainerCorrupt {
        detail: format!("failed to parse field {field}"),
    })?;
    Ok(u64::from_le_bytes(array))
}

pub(crate) fn u64_to_usize(value: u64, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| WeldError::ContainerCorrupt {
        detail: format!("{what} does not fit in usize: {value}"),
    })
}

pub(crate) fn usize_to_u64(value: usize, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| WeldError::ContainerCorrupt {
        detail: format!("{what} does not fit in u64: {value}"),
    })
}

pub(crate) fn usize_to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| WeldError::ContainerCorrupt {
        detail: format!("{what} does not fit in u32: {value}"),
    })
}

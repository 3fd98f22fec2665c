//! Consolidated trajectory containers.
//!
//! A `.twc` container is an append-only single file holding the projected
//! frames of one consolidation unit together with the manifest of fragments
//! already merged into it. The manifest lives inside the same file as the
//! payload it accounts for, written strictly after that payload, which is
//! what makes re-running a merge pass idempotent and crash-safe: a fragment
//! is merged exactly when its identity is readable from the manifest, and a
//! kill at any byte boundary loses at most un-accounted tail records.

mod format;
mod store;

pub use format::{
    CONTAINER_HEADER_BYTES, CONTAINER_MAGIC, CONTAINER_VERSION, ContainerHeader,
    MAX_RECORD_PAYLOAD_BYTES, RECORD_HEADER_BYTES, RecordHeader, TAG_CHUNK, TAG_MANIFEST,
    decode_chunk_frame_count, encode_chunk_payload, encode_record,
};
pub use store::{ConsolidatedStore, MergeOutcome, StoreStats};

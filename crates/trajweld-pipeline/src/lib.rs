//! Fragment-to-container consolidation pipeline.
//!
//! Everything between the filesystem a simulation engine writes into and the
//! durable container a unit ends up with lives here: ordered fragment
//! listing, archive materialization with staged unpack and verification,
//! stride-frame decoding with atom-selection projection, and the single-unit
//! pass that ties them to a [`trajweld_store::ConsolidatedStore`]. Projects
//! files are parsed and expanded into units by [`ProjectsFile`].

mod codec;
mod decode;
#[cfg(test)]
mod fixtures;
mod list;
mod materialize;
mod project;
mod unit;

pub use codec::{FRAME_MARKER, FrameError, PayloadCodec, StrideCodec, encode_frame};
pub use decode::{FrameChunks, verify_payload};
pub use list::list_fragments;
pub use materialize::{AuxFileHandling, MaterializeOptions, STAGING_PREFIX, materialize};
pub use project::{ProjectSpec, ProjectsFile};
pub use unit::{DEFAULT_CHUNK_FRAMES, ProcessOptions, process_unit};

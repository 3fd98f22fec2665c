//! Core value types shared across the trajweld workspace.
//!
//! Everything here is plain data: source fragments as the lister discovers
//! them, the unit of consolidation work handed to the scheduler, decoded
//! payload chunks, and the per-unit report the pool collects. Behavior lives
//! in `trajweld-store`, `trajweld-pipeline`, and `trajweld-sched`.

pub mod cancel;
pub mod topology;

use std::path::PathBuf;
use std::time::Duration;

use trajweld_error::WeldError;

pub use cancel::CancellationToken;
pub use topology::{Selection, Topology, TopologySchema};

/// Name of the payload file inside every raw fragment directory.
pub const PAYLOAD_FILE_NAME: &str = "frames.bin";

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// On-disk form a fragment was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentEncoding {
    /// Directory `frag{N}` holding `frames.bin` plus auxiliary files.
    Raw,
    /// Archive `frag-{N:03}.tar.gz` holding the same directory contents.
    Archived,
}

impl FragmentEncoding {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Archived => "archived",
        }
    }
}

/// One source fragment of a consolidation unit.
///
/// The identity is the raw-form directory path rendered as a string and is
/// fixed at listing time. The archived and raw form of the same sequence
/// index share one identity, so a fragment merged from its archive is still
/// recognized as merged after later materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Source directory the fragment lives in (the unit's `unit_path`).
    pub unit_path: PathBuf,
    /// Zero-based position in the unit's append order.
    pub sequence_index: u64,
    /// Form found on disk (raw wins when both exist).
    pub encoding: FragmentEncoding,
    /// Manifest identity, derived from the raw-form path.
    pub identity: String,
}

impl Fragment {
    #[must_use]
    pub fn new(unit_path: PathBuf, sequence_index: u64, encoding: FragmentEncoding) -> Self {
        let identity = unit_path
            .join(Self::raw_dir_name(sequence_index))
            .to_string_lossy()
            .into_owned();
        Self {
            unit_path,
            sequence_index,
            encoding,
            identity,
        }
    }

    /// Directory name of the raw form, `frag{N}`.
    #[must_use]
    pub fn raw_dir_name(index: u64) -> String {
        format!("frag{index}")
    }

    /// File name of the archived form, `frag-{N:03}.tar.gz`.
    #[must_use]
    pub fn archive_file_name(index: u64) -> String {
        format!("frag-{index:03}.tar.gz")
    }

    /// Raw-form directory path (target of materialization).
    #[must_use]
    pub fn raw_path(&self) -> PathBuf {
        self.unit_path.join(Self::raw_dir_name(self.sequence_index))
    }

    /// Archived-form path; only meaningful when `encoding` is `Archived`.
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.unit_path
            .join(Self::archive_file_name(self.sequence_index))
    }

    /// Path of the payload file inside the raw form.
    #[must_use]
    pub fn payload_path(&self) -> PathBuf {
        self.raw_path().join(PAYLOAD_FILE_NAME)
    }
}

// ---------------------------------------------------------------------------
// Units of work
// ---------------------------------------------------------------------------

/// One consolidation task: a source fragment directory paired with its
/// output container and the topology/selection that governs decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationUnit {
    /// Project the unit was expanded from.
    pub project: String,
    /// Source directory scanned for fragments (`.../run{R}/clone{C}`).
    pub unit_path: PathBuf,
    /// Output container file (`<outpath>/<project>/run{R}-clone{C}.twc`).
    pub container_path: PathBuf,
    /// Topology JSON describing the source frames.
    pub topology_path: PathBuf,
    /// Atom selection expression applied to every frame.
    pub selection: String,
}

impl ConsolidationUnit {
    /// Short label for log lines, `<project>/<container-stem>`.
    #[must_use]
    pub fn label(&self) -> String {
        let stem = self
            .container_path
            .file_stem()
            .map_or_else(|| "?".into(), |s| s.to_string_lossy());
        format!("{}/{stem}", self.project)
    }
}

/// A slice of decoded, selection-projected frames ready for appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChunk {
    /// Number of frames encoded in `frames`.
    pub frame_count: u32,
    /// Projected frame bytes, exactly `frame_count` output frames long.
    pub frames: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Terminal state of one unit pass.
#[derive(Debug)]
pub enum UnitOutcome {
    /// Every listed fragment is in the container's manifest.
    Done,
    /// The cancellation token was observed between fragments; everything
    /// merged so far is durable.
    Cancelled,
    /// A unit-scoped error stopped the pass; sibling units keep running.
    Failed(WeldError),
}

impl UnitOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// What one unit pass did, reported back through the scheduler.
#[derive(Debug)]
pub struct UnitReport {
    pub unit: ConsolidationUnit,
    pub outcome: UnitOutcome,
    /// Fragments returned by the lister this pass.
    pub fragments_listed: usize,
    /// Fragments newly merged this pass.
    pub fragments_merged: usize,
    /// Fragments already present in the manifest and skipped.
    pub fragments_skipped: usize,
    pub elapsed: Duration,
}

impl UnitReport {
    /// Report for a unit that never ran (cancelled before steal).
    #[must_use]
    pub fn skipped(unit: ConsolidationUnit) -> Self {
        Self {
            unit,
            outcome: UnitOutcome::Cancelled,
            fragments_listed: 0,
            fragments_merged: 0,
            fragments_skipped: 0,
            elapsed: Duration::ZERO,
        }
    }
}

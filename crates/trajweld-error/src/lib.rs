//! Error taxonomy for the trajweld workspace.
//!
//! Variants map onto the failure classes the pipeline distinguishes at
//! runtime:
//!
//! - configuration errors ([`WeldError::Config`]) are surfaced before any
//!   unit is scheduled and abort the process;
//! - fragment-scoped errors ([`WeldError::FragmentIntegrity`],
//!   [`WeldError::ArchiveFormat`]) abort one unit's pass and leave the rest
//!   of the batch running;
//! - container errors ([`WeldError::ContainerCorrupt`],
//!   [`WeldError::SchemaMismatch`], [`WeldError::WriterConflict`]) likewise
//!   fail only the unit that owns the container;
//! - [`WeldError::Internal`] marks bugs and impossible states.
//!
//! Cancellation is deliberately *not* an error: it is a normal unit outcome
//! reported by the scheduler.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across every trajweld crate.
pub type Result<T> = std::result::Result<T, WeldError>;

/// All error conditions produced by the trajweld crates.
#[derive(Debug, Error)]
pub enum WeldError {
    /// Invalid operator-supplied configuration (missing path, bad topology,
    /// empty selection). Fatal before processing starts.
    #[error("configuration error: {detail}")]
    Config {
        /// Human-readable description naming the offending entry.
        detail: String,
    },

    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The consolidated container is structurally damaged beyond the
    /// tolerated torn tail (bad magic, mid-file checksum failure, duplicate
    /// manifest identity).
    #[error("container corrupt: {detail}")]
    ContainerCorrupt {
        /// What the recovery scan or decoder observed.
        detail: String,
    },

    /// An existing container's recorded schema does not match the unit's
    /// current topology/selection.
    #[error("schema mismatch for {path}: {detail}")]
    SchemaMismatch {
        /// Container path.
        path: PathBuf,
        /// Recorded-versus-requested difference.
        detail: String,
    },

    /// A second writer attempted to open a container already locked by a
    /// live writer handle.
    #[error("container {path} is already open for writing")]
    WriterConflict {
        /// Container path.
        path: PathBuf,
    },

    /// A fragment failed end-to-end payload verification. Scoped to the
    /// fragment's unit; the named fragment is left for operator inspection.
    #[error("fragment {fragment} failed integrity verification: {detail}")]
    FragmentIntegrity {
        /// Identity of the offending fragment.
        fragment: String,
        /// What the verification pass observed.
        detail: String,
    },

    /// An archived fragment could not be unpacked (truncated gzip stream,
    /// unsafe entry path, missing payload file).
    #[error("archive {path} is not a valid fragment archive: {detail}")]
    ArchiveFormat {
        /// Archive path.
        path: PathBuf,
        /// Unpack failure description.
        detail: String,
    },

    /// Invariant violation inside trajweld itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WeldError {
    /// Build a [`WeldError::Config`] from anything stringly.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Build a [`WeldError::Internal`] from anything stringly.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Whether this error is scoped to a single fragment/unit pass (classes
    /// 2 of the taxonomy) rather than a process-level failure.
    #[must_use]
    pub fn is_unit_scoped(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ContainerCorrupt { .. }
                | Self::SchemaMismatch { .. }
                | Self::WriterConflict { .. }
                | Self::FragmentIntegrity { .. }
                | Self::ArchiveFormat { .. }
        )
    }
}

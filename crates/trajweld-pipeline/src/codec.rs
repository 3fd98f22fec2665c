//! Payload codec boundary.
//!
//! Numeric trajectory parsing proper is out of scope; the pipeline touches
//! frame bytes only through [`PayloadCodec`]. The stock [`StrideCodec`]
//! understands the fixed stride layout fragments are produced in and applies
//! the atom-selection projection; anything richer plugs in at this trait.

use thiserror::Error;

use trajweld_types::{Selection, Topology};

/// Marker leading every frame (`"FRAM"` little-endian).
pub const FRAME_MARKER: u32 = u32::from_le_bytes(*b"FRAM");

/// Marker + embedded frame index.
const FRAME_PREFIX_BYTES: usize = 8;
/// Six cell floats + one time float.
const FRAME_SUFFIX_BYTES: usize = 28;
/// Bytes per atom coordinate triplet.
const TRIPLET_BYTES: usize = 12;

/// Frame-level validation failure. Carries what the bytes looked like; the
/// caller adds fragment identity and frame position.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{got} bytes, expected {expected}")]
    Truncated { got: usize, expected: usize },
    #[error("bad marker {got:#010X}")]
    Marker { got: u32 },
    #[error("embedded frame index {got}, expected {expected}")]
    OutOfOrder { got: u32, expected: u32 },
}

/// Frame-format knowledge the decoder drives through.
pub trait PayloadCodec {
    /// Bytes per source frame.
    fn frame_len(&self) -> usize;

    /// Bytes per projected output frame.
    fn projected_frame_len(&self) -> usize;

    /// Check one source frame at its zero-based position in the fragment.
    fn validate_frame(&self, frame: &[u8], expected_index: u32)
    -> std::result::Result<(), FrameError>;

    /// Append the selected-atom projection of one source frame to `out`.
    fn project_frame(&self, frame: &[u8], out: &mut Vec<u8>)
    -> std::result::Result<(), FrameError>;
}

/// Stock codec for the stride layout: `marker: u32 | frame_index: u32 |
/// atom_count x 3 x f32 | 6 x f32 cell | f32 time`, all little-endian.
///
/// Projection keeps the prefix and suffix and copies only the selected
/// atoms' coordinate triplets, in selection order.
#[derive(Debug, Clone)]
pub struct StrideCodec {
    source_atoms: u32,
    selected: Vec<u32>,
}

impl StrideCodec {
    #[must_use]
    pub fn new(topology: &Topology, selection: &Selection) -> Self {
        Self {
            source_atoms: topology.atom_count,
            selected: selection.atom_indices.clone(),
        }
    }
}

impl PayloadCodec for StrideCodec {
    fn frame_len(&self) -> usize {
        FRAME_PREFIX_BYTES + self.source_atoms as usize * TRIPLET_BYTES + FRAME_SUFFIX_BYTES
    }

    fn projected_frame_len(&self) -> usize {
        FRAME_PREFIX_BYTES + self.selected.len() * TRIPLET_BYTES + FRAME_SUFFIX_BYTES
    }

    fn validate_frame(
        &self,
        frame: &[u8],
        expected_index: u32,
    ) -> std::result::Result<(), FrameError> {
        let expected = self.frame_len();
        if frame.len() != expected {
            return Err(FrameError::Truncated {
                got: frame.len(),
                expected,
            });
        }
        let marker = le_u32_at(frame, 0);
        if marker != FRAME_MARKER {
            return Err(FrameError::Marker { got: marker });
        }
        let embedded = le_u32_at(frame, 4);
        if embedded != expected_index {
            return Err(FrameError::OutOfOrder {
                got: embedded,
                expected: expected_index,
            });
        }
        Ok(())
    }

    fn project_frame(
        &self,
        frame: &[u8],
        out: &mut Vec<u8>,
    ) -> std::result::Result<(), FrameError> {
        let expected = self.frame_len();
        if frame.len() != expected {
            return Err(FrameError::Truncated {
                got: frame.len(),
                expected,
            });
        }
        out.extend_from_slice(&frame[..FRAME_PREFIX_BYTES]);
        for &atom in &self.selected {
            let start = FRAME_PREFIX_BYTES + atom as usize * TRIPLET_BYTES;
            out.extend_from_slice(&frame[start..start + TRIPLET_BYTES]);
        }
        out.extend_from_slice(&frame[expected - FRAME_SUFFIX_BYTES..]);
        Ok(())
    }
}

/// Encode one source frame in the stride layout.
#[must_use]
pub fn encode_frame(frame_index: u32, coords: &[[f32; 3]], cell: &[f32; 6], time: f32) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(FRAME_PREFIX_BYTES + coords.len() * TRIPLET_BYTES + FRAME_SUFFIX_BYTES);
    out.extend_from_slice(&FRAME_MARKER.to_le_bytes());
    out.extend_from_slice(&frame_index.to_le_bytes());
    for triplet in coords {
        for value in triplet {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    for value in cell {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(&time.to_le_bytes());
    out
}

fn le_u32_at(bytes: &[u8], start: usize) -> u32 {
    let mut field = [0_u8; 4];
    field.copy_from_slice(&bytes[start..start + 4]);
    u32::from_le_bytes(field)
}

//! Chunked payload decoding.
//!
//! [`FrameChunks`] streams a raw fragment's payload file through a
//! [`PayloadCodec`], validating and projecting one frame at a time and
//! yielding bounded [`PayloadChunk`]s. The whole fragment is never resident
//! in memory; peak usage is one source frame plus one output chunk.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::debug;

use trajweld_error::{Result, WeldError};
use trajweld_types::{PAYLOAD_FILE_NAME, PayloadChunk};

use crate::codec::PayloadCodec;

/// Lazy iterator over a fragment's projected frames.
pub struct FrameChunks<'a> {
    reader: BufReader<File>,
    codec: &'a dyn PayloadCodec,
    identity: String,
    chunk_frames: u32,
    total_frames: u32,
    next_index: u32,
    frame_buf: Vec<u8>,
    failed: bool,
}

impl std::fmt::Debug for FrameChunks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChunks")
            .field("identity", &self.identity)
            .field("chunk_frames", &self.chunk_frames)
            .field("total_frames", &self.total_frames)
            .field("next_index", &self.next_index)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<'a> FrameChunks<'a> {
    /// Open the payload file inside a raw fragment directory.
    ///
    /// The file length must divide exactly into source frames; anything
    /// else means the payload is truncated or foreign.
    pub fn open(
        raw_path: &Path,
        identity: &str,
        codec: &'a dyn PayloadCodec,
        chunk_frames: u32,
    ) -> Result<Self> {
        if chunk_frames == 0 {
            return Err(WeldError::internal("chunk_frames must be non-zero"));
        }
        let payload_path = raw_path.join(PAYLOAD_FILE_NAME);
        let file = File::open(&payload_path)?;
        let payload_len = file.metadata()?.len();

        let frame_len = codec.frame_len() as u64;
        if payload_len % frame_len != 0 {
            return Err(WeldError::FragmentIntegrity {
                fragment: identity.to_owned(),
                detail: format!(
                    "payload length {payload_len} is not a multiple of the {frame_len} byte frame"
                ),
            });
        }
        let total_frames =
            u32::try_from(payload_len / frame_len).map_err(|_| WeldError::FragmentIntegrity {
                fragment: identity.to_owned(),
                detail: format!("fragment holds {} frames, beyond the addressable range", payload_len / frame_len),
            })?;

        debug!(
            path = %payload_path.display(),
            total_frames,
            chunk_frames,
            "opened fragment payload for decoding"
        );

        Ok(Self {
            reader: BufReader::new(file),
            codec,
            identity: identity.to_owned(),
            chunk_frames,
            total_frames,
            next_index: 0,
            frame_buf: vec![0_u8; codec.frame_len()],
            failed: false,
        })
    }

    /// Frames the payload file holds in total.
    #[must_use]
    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    fn read_one_frame(&mut self) -> Result<()> {
        self.reader.read_exact(&mut self.frame_buf)?;
        self.codec
            .validate_frame(&self.frame_buf, self.next_index)
            .map_err(|err| WeldError::FragmentIntegrity {
                fragment: self.identity.clone(),
                detail: format!("frame {}: {err}", self.next_index),
            })?;
        Ok(())
    }
}

impl Iterator for FrameChunks<'_> {
    type Item = Result<PayloadChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_index >= self.total_frames {
            return None;
        }
        let want = self.chunk_frames.min(self.total_frames - self.next_index);
        let mut frames = Vec::with_capacity(want as usize * self.codec.projected_frame_len());
        for _ in 0..want {
            if let Err(err) = self.read_one_frame() {
                self.failed = true;
                return Some(Err(err));
            }
            let projected = self.codec.project_frame(&self.frame_buf, &mut frames);
            if let Err(err) = projected {
                self.failed = true;
                return Some(Err(WeldError::FragmentIntegrity {
                    fragment: self.identity.clone(),
                    detail: format!("frame {}: {err}", self.next_index),
                }));
            }
            self.next_index += 1;
        }
        Some(Ok(PayloadChunk {
            frame_count: want,
            frames,
        }))
    }
}

/// Stream every frame of a payload file through the codec without keeping
/// any output, returning the frame count. Used by materialization to verify
/// a freshly unpacked fragment end-to-end.
pub fn verify_payload(raw_path: &Path, identity: &str, codec: &dyn PayloadCodec) -> Result<u64> {
    let payload_path = raw_path.join(PAYLOAD_FILE_NAME);
    let file = File::open(&payload_path)?;
    let payload_len = file.metadata()?.len();

    let frame_len = codec.frame_len() as u64;
    if payload_len % frame_len != 0 {
        return Err(WeldError::FragmentIntegrity {
            fragment: identity.to_owned(),
            detail: format!(
                "payload length {payload_len} is not a multiple of the {frame_len} byte frame"
            ),
        });
    }

    let mut reader = BufReader::new(file);
    let mut frame_buf = vec![0_u8; codec.frame_len()];
    let total = payload_len / frame_len;
    for index in 0..total {
        reader.read_exact(&mut frame_buf)?;
        let expected = u32::try_from(index).map_err(|_| WeldError::FragmentIntegrity {
            fragment: identity.to_owned(),
            detail: format!("fragment holds {total} frames, beyond the addressable range"),
        })?;
        codec
            .validate_frame(&frame_buf, expected)
            .map_err(|err| WeldError::FragmentIntegrity {
                fragment: identity.to_owned(),
                detail: format!("frame {index}: {err}"),
            })?;
    }
    Ok(total)
}

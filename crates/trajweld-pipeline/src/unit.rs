//! Single-unit consolidation pass: list fragments, materialize each one,
//! decode it, and merge it into the unit's container.
//!
//! A pass is resumable at fragment granularity. Fragments already named by
//! the container manifest are skipped, so re-running a finished or
//! interrupted unit converges on the same container bytes. A failure stops
//! the pass at the offending fragment; everything merged before it stays
//! durable, and the manifest never develops a gap.

use std::time::Instant;

use tracing::{debug, info, warn};

use trajweld_error::Result;
use trajweld_store::{ConsolidatedStore, MergeOutcome};
use trajweld_types::{
    CancellationToken, ConsolidationUnit, Topology, TopologySchema, UnitOutcome, UnitReport,
};

use crate::codec::StrideCodec;
use crate::decode::FrameChunks;
use crate::list::list_fragments;
use crate::materialize::{MaterializeOptions, materialize};

/// Frames carried per chunk record when the caller does not override it.
pub const DEFAULT_CHUNK_FRAMES: u32 = 64;

/// Knobs for a single unit pass.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Frames per chunk record written into the container.
    pub chunk_frames: u32,
    pub materialize: MaterializeOptions,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            materialize: MaterializeOptions::default(),
        }
    }
}

/// Run one consolidation pass over `unit`.
///
/// Never panics and never returns an error: every failure is folded into
/// the report's outcome so sibling units keep running.
pub fn process_unit(
    unit: &ConsolidationUnit,
    options: &ProcessOptions,
    token: &CancellationToken,
) -> UnitReport {
    let started = Instant::now();
    let mut counters = Counters::default();
    let outcome = match run_unit(unit, options, token, &mut counters) {
        Ok(outcome) => outcome,
        Err(err) => UnitOutcome::Failed(err),
    };
    match &outcome {
        UnitOutcome::Done => info!(
            unit = %unit.label(),
            listed = counters.listed,
            merged = counters.merged,
            skipped = counters.skipped,
            elapsed = ?started.elapsed(),
            "unit consolidated"
        ),
        UnitOutcome::Cancelled => info!(
            unit = %unit.label(),
            merged = counters.merged,
            "unit pass cancelled, merged fragments are durable"
        ),
        UnitOutcome::Failed(err) => warn!(
            unit = %unit.label(),
            merged = counters.merged,
            error = %err,
            "unit pass failed"
        ),
    }
    UnitReport {
        unit: unit.clone(),
        outcome,
        fragments_listed: counters.listed,
        fragments_merged: counters.merged,
        fragments_skipped: counters.skipped,
        elapsed: started.elapsed(),
    }
}

#[derive(Debug, Default)]
struct Counters {
    listed: usize,
    merged: usize,
    skipped: usize,
}

fn run_unit(
    unit: &ConsolidationUnit,
    options: &ProcessOptions,
    token: &CancellationToken,
    counters: &mut Counters,
) -> Result<UnitOutcome> {
    if token.is_cancelled() {
        return Ok(UnitOutcome::Cancelled);
    }

    let fragments = list_fragments(&unit.unit_path)?;
    counters.listed = fragments.len();
    if fragments.is_empty() {
        debug!(unit = %unit.label(), "no fragments to consolidate");
        return Ok(UnitOutcome::Done);
    }

    let topology = Topology::load(&unit.topology_path)?;
    let selection = topology.resolve(&unit.selection)?;
    let codec = StrideCodec::new(&topology, &selection);
    let schema = TopologySchema::from_parts(&topology, &selection);

    let mut store = ConsolidatedStore::open(&unit.container_path, &schema)?;
    for fragment in &fragments {
        // Fragment boundaries are the cancellation points; a fragment merge
        // in flight always runs to completion.
        if token.is_cancelled() {
            store.close()?;
            return Ok(UnitOutcome::Cancelled);
        }
        if store.contains(&fragment.identity) {
            counters.skipped += 1;
            debug!(fragment = %fragment.identity, "already in manifest, skipping");
            continue;
        }
        let raw_path = materialize(fragment, &codec, &options.materialize)?;
        let chunks = FrameChunks::open(&raw_path, &fragment.identity, &codec, options.chunk_frames)?;
        match store.merge_fragment(&fragment.identity, chunks)? {
            MergeOutcome::Merged {
                chunk_records,
                frames,
            } => {
                counters.merged += 1;
                debug!(
                    fragment = %fragment.identity,
                    chunk_records,
                    frames,
                    "fragment merged"
                );
            }
            MergeOutcome::AlreadyMerged => counters.skipped += 1,
        }
    }
    store.close()?;
    Ok(UnitOutcome::Done)
}

// ---------------------------------------------------------------------------

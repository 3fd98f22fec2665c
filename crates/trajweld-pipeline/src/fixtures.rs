//! Shared test fixtures: synthetic topologies, stride-layout payloads, and
//! fragment forms on disk.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use trajweld_types::{Fragment, PAYLOAD_FILE_NAME, Topology};

use crate::codec::encode_frame;

/// Topology with an `all` group and a `first_half` group (atoms
/// `0..atom_count / 2`).
pub(crate) fn topology(atom_count: u32) -> Topology {
    let mut groups = BTreeMap::new();
    groups.insert("all".to_string(), (0..atom_count).collect::<Vec<u32>>());
    groups.insert(
        "first_half".to_string(),
        (0..atom_count / 2).collect::<Vec<u32>>(),
    );
    Topology {
        name: "fixture".to_string(),
        atom_count,
        groups,
    }
}

pub(crate) fn write_topology_json(dir: &Path, atom_count: u32) -> PathBuf {
    let path = dir.join("topology.json");
    let text = serde_json::to_string(&topology(atom_count)).expect("encode topology");
    fs::write(&path, text).expect("write topology");
    path
}

/// One stride-layout frame with deterministic coordinates: atom `a` of
/// frame `i` sits at `(i, a, 0.5)`.
pub(crate) fn frame_bytes(index: u32, atoms: u32) -> Vec<u8> {
    let coords: Vec<[f32; 3]> = (0..atoms)
        .map(|atom| [index as f32, atom as f32, 0.5])
        .collect();
    encode_frame(
        index,
        &coords,
        &[25.0, 25.0, 25.0, 90.0, 90.0, 90.0],
        index as f32 * 0.1,
    )
}

pub(crate) fn payload_bytes(frame_count: u32, atoms: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for index in 0..frame_count {
        out.extend_from_slice(&frame_bytes(index, atoms));
    }
    out
}

/// Create `frag{index}/frames.bin` under `unit_dir`, returning the raw dir.
pub(crate) fn write_raw_fragment(
    unit_dir: &Path,
    index: u64,
    frame_count: u32,
    atoms: u32,
) -> PathBuf {
    let raw = unit_dir.join(Fragment::raw_dir_name(index));
    fs::create_dir_all(&raw).expect("create raw fragment dir");
    fs::write(raw.join(PAYLOAD_FILE_NAME), payload_bytes(frame_count, atoms))
        .expect("write payload");
    raw
}

/// Write a gzip-compressed tar with the given `(entry_name, bytes)` pairs.
pub(crate) fn write_tar_gz(archive_path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(archive_path).expect("create archive");
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *bytes)
            .expect("append archive entry");
    }
    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish gzip");
}

/// Create `frag-{index:03}.tar.gz` under `unit_dir` holding the payload and
/// one auxiliary file, returning the archive path.
pub(crate) fn write_archive_fragment(
    unit_dir: &Path,
    index: u64,
    frame_count: u32,
    atoms: u32,
) -> PathBuf {
    let archive = unit_dir.join(Fragment::archive_file_name(index));
    let dir_name = Fragment::raw_dir_name(index);
    let payload = payload_bytes(frame_count, atoms);
    write_tar_gz(
        &archive,
        &[
            (
                &format!("{dir_name}/{PAYLOAD_FILE_NAME}"),
                payload.as_slice(),
            ),
            (&format!("{dir_name}/notes.xml"), b"<aux/>".as_slice()),
        ],
    );
    archive
}

//! Exclusive-writer container store with an embedded merge manifest.
//!
//! A [`ConsolidatedStore`] owns one `.twc` file for the duration of a merge
//! pass. Opening takes a non-blocking exclusive `flock`, replays the record
//! stream to rebuild the manifest, and truncates any torn tail back to the
//! last valid record boundary. Merging appends all chunk records of a
//! fragment, syncs, then appends the manifest entry and syncs again, so a
//! manifest entry on disk always implies its payload is durable. A crash
//! between those two syncs leaves orphan chunk records that the next pass
//! appends over; the manifest itself never holds an identity twice.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use trajweld_error::{Result, WeldError};
use trajweld_types::{PayloadChunk, TopologySchema};

use crate::format::{
    CONTAINER_HEADER_BYTES, ContainerHeader, MAX_RECORD_PAYLOAD_BYTES, RECORD_HEADER_BYTES,
    RecordHeader, TAG_CHUNK, TAG_MANIFEST, decode_chunk_frame_count, encode_chunk_payload,
    encode_record, u64_to_usize, usize_to_u64,
};

/// What one `merge_fragment` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The fragment was appended and is now in the manifest.
    Merged { chunk_records: u64, frames: u64 },
    /// The identity was already in the manifest; nothing was written.
    AlreadyMerged,
}

/// Physical and logical counters for an open container.
///
/// `chunk_records` and `total_frames` count every valid chunk record in the
/// file, including orphans left behind by interrupted merges; the manifest
/// count is the logical number of merged fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub merged_fragments: usize,
    pub chunk_records: u64,
    pub total_frames: u64,
    pub file_bytes: u64,
}

/// Single-writer handle on one consolidated container.
pub struct ConsolidatedStore {
    path: PathBuf,
    file: Flock<File>,
    schema: TopologySchema,
    manifest_order: Vec<String>,
    manifest_index: HashSet<String>,
    end_offset: u64,
    chunk_records: u64,
    total_frames: u64,
}

impl std::fmt::Debug for ConsolidatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidatedStore")
            .field("path", &self.path)
            .field("merged_fragments", &self.manifest_order.len())
            .field("end_offset", &self.end_offset)
            .finish_non_exhaustive()
    }
}

impl ConsolidatedStore {
    /// Open a container, creating it when absent.
    ///
    /// An existing container must carry a schema equal to `schema`; a
    /// mismatch is an error, never an overwrite. The open-time recovery
    /// scan truncates a torn tail and rebuilds the manifest.
    pub fn open(path: &Path, schema: &TopologySchema) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file = lock_exclusive(file, path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Self::initialize(path.to_path_buf(), file, schema);
        }
        Self::recover(path.to_path_buf(), file, file_len, schema)
    }

    /// Create a brand-new container, failing if the path already exists.
    pub fn create(path: &Path, schema: &TopologySchema) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let file = lock_exclusive(file, path)?;
        Self::initialize(path.to_path_buf(), file, schema)
    }

    /// Idempotently merge one fragment's chunk stream.
    ///
    /// Durability order: every chunk record, `sync_data`, the manifest
    /// entry, `sync_data`. An error from the chunk iterator aborts the merge
    /// mid-stream; chunk records appended so far stay in the file as orphans
    /// and the identity stays out of the manifest, so a later pass re-merges
    /// the fragment from scratch.
    pub fn merge_fragment<I>(&mut self, identity: &str, chunks: I) -> Result<MergeOutcome>
    where
        I: IntoIterator<Item = Result<PayloadChunk>>,
    {
        if self.manifest_index.contains(identity) {
            debug!(
                path = %self.path.display(),
                fragment = identity,
                "fragment already in manifest; skipping"
            );
            return Ok(MergeOutcome::AlreadyMerged);
        }

        let mut appended_chunks = 0_u64;
        let mut appended_frames = 0_u64;
        for chunk in chunks {
            let chunk = chunk?;
            let payload = encode_chunk_payload(chunk.frame_count, &chunk.frames);
            self.append_record(TAG_CHUNK, &payload)?;
            appended_chunks += 1;
            appended_frames += u64::from(chunk.frame_count);
            self.chunk_records += 1;
            self.total_frames += u64::from(chunk.frame_count);
        }

        self.file.sync_data()?;
        self.append_record(TAG_MANIFEST, identity.as_bytes())?;
        self.file.sync_data()?;

        self.manifest_index.insert(identity.to_owned());
        self.manifest_order.push(identity.to_owned());

        debug!(
            path = %self.path.display(),
            fragment = identity,
            chunks = appended_chunks,
            frames = appended_frames,
            "merged fragment"
        );
        Ok(MergeOutcome::Merged {
            chunk_records: appended_chunks,
            frames: appended_frames,
        })
    }

    /// Whether a fragment identity is already in the manifest.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.manifest_index.contains(identity)
    }

    /// Merged fragment identities in merge order.
    #[must_use]
    pub fn manifest(&self) -> &[String] {
        &self.manifest_order
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            merged_fragments: self.manifest_order.len(),
            chunk_records: self.chunk_records,
            total_frames: self.total_frames,
            file_bytes: self.end_offset,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn schema(&self) -> &TopologySchema {
        &self.schema
    }

    /// Final sync, then release the writer lock via drop.
    pub fn close(self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn initialize(path: PathBuf, file: Flock<File>, schema: &TopologySchema) -> Result<Self> {
        let schema_bytes = encode_schema(schema)?;
        let schema_len = usize_to_u64(schema_bytes.len(), "schema length")?;
        let header = ContainerHeader::new(unix_now_secs(), schema_len, xxh3_64(&schema_bytes));

        let mut preamble = Vec::with_capacity(CONTAINER_HEADER_BYTES + schema_bytes.len());
        preamble.extend_from_slice(&header.encode());
        preamble.extend_from_slice(&schema_bytes);

        // Also covers re-initialization after a torn creation.
        file.set_len(0)?;
        let mut out: &File = &file;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&preamble)?;
        file.sync_data()?;

        let end_offset = usize_to_u64(preamble.len(), "container preamble length")?;
        info!(
            path = %path.display(),
            topology = %schema.topology_name,
            selection = %schema.selection_expression,
            selected_atoms = schema.selected_atom_count,
            "created consolidated container"
        );

        Ok(Self {
            path,
            file,
            schema: schema.clone(),
            manifest_order: Vec::new(),
            manifest_index: HashSet::new(),
            end_offset,
            chunk_records: 0,
            total_frames: 0,
        })
    }

    fn recover(
        path: PathBuf,
        file: Flock<File>,
        file_len: u64,
        requested: &TopologySchema,
    ) -> Result<Self> {
        let header_len = usize_to_u64(CONTAINER_HEADER_BYTES, "container header size")?;
        if file_len < header_len {
            warn!(
                path = %path.display(),
                file_len,
                "container shorter than its header; re-initializing torn creation"
            );
            return Self::initialize(path, file, requested);
        }

        let mut header_buf = [0_u8; CONTAINER_HEADER_BYTES];
        let mut reader: &File = &file;
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut header_buf)?;
        let header = ContainerHeader::decode(&header_buf)?;

        let data_start = header.data_start()?;
        if file_len < data_start {
            warn!(
                path = %path.display(),
                file_len,
                data_start,
                "container schema block torn; re-initializing"
            );
            return Self::initialize(path, file, requested);
        }

        let schema_len = u64_to_usize(header.schema_len, "schema length")?;
        let mut schema_bytes = vec![0_u8; schema_len];
        reader.read_exact(&mut schema_bytes)?;
        let computed = xxh3_64(&schema_bytes);
        if computed != header.schema_hash {
            return Err(WeldError::ContainerCorrupt {
                detail: format!(
                    "schema block checksum mismatch in {}: stored {:#018X}, computed {computed:#018X}",
                    path.display(),
                    header.schema_hash
                ),
            });
        }
        let stored: TopologySchema =
            serde_json::from_slice(&schema_bytes).map_err(|err| WeldError::ContainerCorrupt {
                detail: format!("schema block in {} is not valid JSON: {err}", path.display()),
            })?;
        if let Some(detail) = stored.mismatch_detail(requested) {
            return Err(WeldError::SchemaMismatch {
                path: path.clone(),
                detail,
            });
        }

        let scan = scan_records(&file, data_start, file_len, &path)?;
        if scan.end_offset < file_len {
            warn!(
                path = %path.display(),
                valid_end = scan.end_offset,
                file_len,
                "truncating container to last valid record boundary"
            );
            file.set_len(scan.end_offset)?;
            file.sync_data()?;
        }

        let mut writer: &File = &file;
        writer.seek(SeekFrom::Start(scan.end_offset))?;

        info!(
            path = %path.display(),
            merged_fragments = scan.manifest_order.len(),
            chunk_records = scan.chunk_records,
            total_frames = scan.total_frames,
            "opened consolidated container"
        );

        Ok(Self {
            path,
            file,
            schema: stored,
            manifest_order: scan.manifest_order,
            manifest_index: scan.manifest_index,
            end_offset: scan.end_offset,
            chunk_records: scan.chunk_records,
            total_frames: scan.total_frames,
        })
    }

    fn append_record(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let record = encode_record(tag, payload)?;
        let mut out: &File = &self.file;
        out.write_all(&record)?;
        let record_len = usize_to_u64(record.len(), "record length")?;
        self.end_offset = self
            .end_offset
            .checked_add(record_len)
            .ok_or_else(|| WeldError::Internal("container offset overflow".to_owned()))?;
        Ok(())
    }
}

/// State rebuilt by the open-time record scan.
struct RecoveredTail {
    manifest_order: Vec<String>,
    manifest_index: HashSet<String>,
    chunk_records: u64,
    total_frames: u64,
    /// Offset just past the last valid record; everything beyond is torn.
    end_offset: u64,
}

/// Replay the record stream, stopping at the first incomplete or invalid
/// record. A duplicate manifest identity is corruption, not a torn tail.
fn scan_records(file: &File, data_start: u64, file_len: u64, path: &Path) -> Result<RecoveredTail> {
    let prefix_len = usize_to_u64(RECORD_HEADER_BYTES, "record prefix size")?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(data_start))?;

    let mut offset = data_start;
    let mut manifest_order = Vec::new();
    let mut manifest_index: HashSet<String> = HashSet::new();
    let mut chunk_records = 0_u64;
    let mut total_frames = 0_u64;
    let mut prefix = [0_u8; RECORD_HEADER_BYTES];
    let mut payload = Vec::new();

    while offset < file_len {
        let remaining = file_len - offset;
        if remaining < prefix_len {
            warn!(
                path = %path.display(),
                offset,
                remaining,
                "torn record prefix at container tail"
            );
            break;
        }
        reader.read_exact(&mut prefix)?;
        let record = RecordHeader::decode(&prefix)?;
        let payload_len = record.payload_len as usize;
        if payload_len > MAX_RECORD_PAYLOAD_BYTES {
            warn!(
                path = %path.display(),
                offset,
                payload_len,
                "implausible record payload length; treating tail as torn"
            );
            break;
        }
        if remaining - prefix_len < record.payload_len as u64 {
            warn!(
                path = %path.display(),
                offset,
                payload_len,
                "torn record payload at container tail"
            );
            break;
        }
        payload.resize(payload_len, 0);
        reader.read_exact(&mut payload)?;
        if xxh3_64(&payload) != record.payload_hash {
            warn!(
                path = %path.display(),
                offset,
                tag = record.tag,
                "record checksum mismatch; treating tail as torn"
            );
            break;
        }

        match record.tag {
            TAG_CHUNK => {
                let frame_count = decode_chunk_frame_count(&payload)?;
                chunk_records += 1;
                total_frames += u64::from(frame_count);
            }
            TAG_MANIFEST => {
                let identity = std::str::from_utf8(&payload)
                    .map_err(|_| WeldError::ContainerCorrupt {
                        detail: format!(
                            "manifest record at offset {offset} in {} is not valid UTF-8",
                            path.display()
                        ),
                    })?
                    .to_owned();
                if !manifest_index.insert(identity.clone()) {
                    return Err(WeldError::ContainerCorrupt {
                        detail: format!(
                            "fragment '{identity}' appears twice in the manifest of {}",
                            path.display()
                        ),
                    });
                }
                manifest_order.push(identity);
            }
            other => {
                warn!(
                    path = %path.display(),
                    offset,
                    tag = other,
                    "unknown record tag; treating tail as torn"
                );
                break;
            }
        }

        offset += prefix_len + record.payload_len as u64;
    }

    Ok(RecoveredTail {
        manifest_order,
        manifest_index,
        chunk_records,
        total_frames,
        end_offset: offset,
    })
}

fn lock_exclusive(file: File, path: &Path) -> Result<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK {
            WeldError::WriterConflict {
                path: path.to_path_buf(),
            }
        } else {
            WeldError::Io(std::io::Error::from_raw_os_error(errno as i32))
        }
    })
}

fn encode_schema(schema: &TopologySchema) -> Result<Vec<u8>> {
    serde_json::to_vec(schema)
        .map_err(|err| WeldError::Internal(format!("failed to encode container schema: {err}")))
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    fn test_schema() -> TopologySchema {
        TopologySchema {
            topology_name: "villin".to_string(),
            source_atom_count: 8,
            selection_expression: "protein".to_string(),
            selected_atom_count: 4,
            selection_hash: 0x51C4_D00D_0000_0001,
        }
    }

    fn other_schema() -> TopologySchema {
        TopologySchema {
            selection_expression: "not solvent".to_string(),
            selected_atom_count: 3,
            selection_hash: 0x51C4_D00D_0000_0002,
            ..test_schema()
        }
    }

    fn chunk(frame_count: u32, fill: u8) -> PayloadChunk {
        PayloadChunk {
            frame_count,
            frames: vec![fill; frame_count as usize * 16],
        }
    }

    fn chunks_of(spec: &[(u32, u8)]) -> Vec<Result<PayloadChunk>> {
        spec.iter().map(|&(n, fill)| Ok(chunk(n, fill))).collect()
    }

    #[test]
    fn test_open_creates_and_reopen_preserves_state() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run0-clone0.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("create via open");
        let outcome = store
            .merge_fragment("frag0", chunks_of(&[(4, 0xA0), (2, 0xA1)]))
            .expect("merge frag0");
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                chunk_records: 2,
                frames: 6
            }
        );
        store.close().expect("close");

        let store = ConsolidatedStore::open(&path, &schema).expect("reopen");
        assert!(store.contains("frag0"));
        assert_eq!(store.manifest().join(","), "frag0");
        let stats = store.stats();
        assert_eq!(stats.merged_fragments, 1);
        assert_eq!(stats.chunk_records, 2);
        assert_eq!(stats.total_frames, 6);
        assert_eq!(stats.file_bytes, fs::metadata(&path).expect("metadata").len());
        store.close().expect("close");
    }

    #[test]
    fn test_remerge_is_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        store
            .merge_fragment("frag0", chunks_of(&[(4, 0xA0), (2, 0xA1)]))
            .expect("merge frag0");
        store
            .merge_fragment("frag1", chunks_of(&[(3, 0xB0)]))
            .expect("merge frag1");
        store.close().expect("close");
        let first_pass = fs::read(&path).expect("read after first pass");

        let mut store = ConsolidatedStore::open(&path, &schema).expect("reopen");
        assert_eq!(
            store
                .merge_fragment("frag0", chunks_of(&[(4, 0xA0), (2, 0xA1)]))
                .expect("remerge frag0"),
            MergeOutcome::AlreadyMerged
        );
        assert_eq!(
            store
                .merge_fragment("frag1", chunks_of(&[(3, 0xB0)]))
                .expect("remerge frag1"),
            MergeOutcome::AlreadyMerged
        );
        store.close().expect("close");
        let second_pass = fs::read(&path).expect("read after second pass");

        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_interrupted_merge_resumes_without_manifest_duplicate() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        store
            .merge_fragment("frag0", chunks_of(&[(2, 0x01)]))
            .expect("merge frag0");
        let err = store
            .merge_fragment(
                "frag1",
                vec![
                    Ok(chunk(2, 0x02)),
                    Err(WeldError::internal("decode interrupted")),
                ],
            )
            .expect_err("merge must abort on chunk error");
        assert!(matches!(err, WeldError::Internal(_)), "got {err:?}");
        assert!(!store.contains("frag1"));
        store.close().expect("close");

        let mut store = ConsolidatedStore::open(&path, &schema).expect("reopen");
        assert_eq!(store.manifest().join(","), "frag0");
        // The aborted merge's chunk survives as an orphan payload record.
        assert_eq!(store.stats().chunk_records, 2);

        let outcome = store
            .merge_fragment("frag1", chunks_of(&[(2, 0x02), (1, 0x03)]))
            .expect("resume merge");
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                chunk_records: 2,
                frames: 3
            }
        );
        assert_eq!(store.manifest().join(","), "frag0,frag1");
        assert_eq!(store.stats().chunk_records, 4);
        store.close().expect("close");
    }

    #[test]
    fn test_torn_tail_truncated_on_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        store
            .merge_fragment("frag0", chunks_of(&[(2, 0x10)]))
            .expect("merge frag0");
        store.close().expect("close");
        let clean_len = fs::metadata(&path).expect("metadata").len();

        let half_record = {
            let full = encode_record(TAG_CHUNK, &encode_chunk_payload(3, &[0x77; 48]))
                .expect("encode record");
            full[..full.len() / 2].to_vec()
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        file.write_all(&half_record).expect("write torn tail");
        file.sync_data().expect("sync torn tail");
        drop(file);

        let store = ConsolidatedStore::open(&path, &schema).expect("reopen with torn tail");
        assert_eq!(store.manifest().join(","), "frag0");
        store.close().expect("close");
        assert_eq!(fs::metadata(&path).expect("metadata").len(), clean_len);
    }

    #[test]
    fn test_checksum_mismatch_truncates_from_damage_point() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        store
            .merge_fragment("frag0", chunks_of(&[(2, 0x10)]))
            .expect("merge frag0");
        let frag0_end = store.stats().file_bytes;
        store
            .merge_fragment("frag1", chunks_of(&[(2, 0x20)]))
            .expect("merge frag1");
        store.close().expect("close");

        // Flip one byte inside frag1's chunk payload.
        let mut bytes = fs::read(&path).expect("read container");
        let target = usize::try_from(frag0_end).expect("offset fits usize") + RECORD_HEADER_BYTES + 6;
        bytes[target] ^= 0xFF;
        fs::write(&path, &bytes).expect("write damaged container");

        let store = ConsolidatedStore::open(&path, &schema).expect("reopen damaged");
        // frag1's manifest entry sits after the damaged chunk, so both go.
        assert_eq!(store.manifest().join(","), "frag0");
        assert_eq!(store.stats().file_bytes, frag0_end);
        store.close().expect("close");
    }

    #[test]
    fn test_unknown_tag_treated_as_torn_tail() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        store
            .merge_fragment("frag0", chunks_of(&[(1, 0x33)]))
            .expect("merge frag0");
        store.close().expect("close");
        let clean_len = fs::metadata(&path).expect("metadata").len();

        let stray = encode_record(9, b"future record kind").expect("encode stray record");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        file.write_all(&stray).expect("append stray record");
        drop(file);

        let store = ConsolidatedStore::open(&path, &schema).expect("reopen");
        assert_eq!(store.manifest().join(","), "frag0");
        store.close().expect("close");
        assert_eq!(fs::metadata(&path).expect("metadata").len(), clean_len);
    }

    #[test]
    fn test_duplicate_manifest_identity_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        store
            .merge_fragment("frag0", chunks_of(&[(1, 0x44)]))
            .expect("merge frag0");
        store.close().expect("close");

        let duplicate = encode_record(TAG_MANIFEST, b"frag0").expect("encode duplicate");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        file.write_all(&duplicate).expect("append duplicate");
        drop(file);

        let err = ConsolidatedStore::open(&path, &schema).expect_err("duplicate must fail");
        assert!(matches!(err, WeldError::ContainerCorrupt { .. }), "got {err:?}");
    }

    #[test]
    fn test_second_writer_rejected_until_first_closes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let first = ConsolidatedStore::open(&path, &schema).expect("first writer");
        let err = ConsolidatedStore::open(&path, &schema).expect_err("second writer must fail");
        assert!(matches!(err, WeldError::WriterConflict { .. }), "got {err:?}");

        first.close().expect("close first");
        let second = ConsolidatedStore::open(&path, &schema).expect("writer after release");
        second.close().expect("close second");
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");

        let store = ConsolidatedStore::open(&path, &test_schema()).expect("create");
        store.close().expect("close");

        let err = ConsolidatedStore::open(&path, &other_schema()).expect_err("must reject");
        match err {
            WeldError::SchemaMismatch { detail, .. } => {
                assert!(detail.contains("selection"), "detail: {detail}");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_create_rejects_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        ConsolidatedStore::create(&path, &schema)
            .expect("create")
            .close()
            .expect("close");
        let err = ConsolidatedStore::create(&path, &schema).expect_err("second create must fail");
        assert!(matches!(err, WeldError::Io(_)), "got {err:?}");
    }

    #[test]
    fn test_torn_creation_is_reinitialized() {
        let dir = tempdir().expect("tempdir");
        let schema = test_schema();

        // Crash before the header finished writing.
        let short = dir.path().join("short.twc");
        fs::write(&short, [0xAB_u8; 10]).expect("write stub");
        let store = ConsolidatedStore::open(&short, &schema).expect("reinit short file");
        assert!(store.manifest().is_empty());
        store.close().expect("close");

        // Crash after the header but mid-schema: header claims more schema
        // bytes than the file holds.
        let torn = dir.path().join("torn.twc");
        let header = ContainerHeader::new(unix_now_secs(), 1000, 7);
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0x00; 50]);
        fs::write(&torn, &bytes).expect("write torn preamble");
        let store = ConsolidatedStore::open(&torn, &schema).expect("reinit torn schema");
        assert!(store.manifest().is_empty());
        store
            .close()
            .expect("close reinitialized container");
    }

    #[test]
    fn test_empty_chunk_stream_still_records_manifest() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("unit.twc");
        let schema = test_schema();

        let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
        let outcome = store
            .merge_fragment("frag0", Vec::new())
            .expect("merge empty fragment");
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                chunk_records: 0,
                frames: 0
            }
        );
        store.close().expect("close");

        let store = ConsolidatedStore::open(&path, &schema).expect("reopen");
        assert!(store.contains("frag0"));
        assert_eq!(store.stats().total_frames, 0);
        store.close().expect("close");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_recovery_tolerates_any_truncation(cut_permille in 0_u64..=1000) {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("unit.twc");
            let schema = test_schema();

            let full_len = {
                let mut store = ConsolidatedStore::open(&path, &schema).expect("open");
                for idx in 0..3_u32 {
                    let identity = format!("frag{idx}");
                    store
                        .merge_fragment(&identity, chunks_of(&[(2, idx as u8), (1, idx as u8)]))
                        .expect("merge");
                }
                store.close().expect("close");
                fs::metadata(&path).expect("metadata").len()
            };

            let cut = full_len * cut_permille / 1000;
            let file = OpenOptions::new().write(true).open(&path).expect("open raw");
            file.set_len(cut).expect("truncate");
            file.sync_data().expect("sync");
            drop(file);

            let mut store = ConsolidatedStore::open(&path, &schema).expect("recover");
            let recovered: Vec<String> = store.manifest().to_vec();
            prop_assert!(recovered.len() <= 3);
            // The manifest is always a gap-free prefix of the merge order.
            for (idx, identity) in recovered.iter().enumerate() {
                let expected = format!("frag{idx}");
                prop_assert_eq!(identity.as_str(), expected.as_str());
            }

            for idx in 0..3_u32 {
                let identity = format!("frag{idx}");
                store
                    .merge_fragment(&identity, chunks_of(&[(2, idx as u8), (1, idx as u8)]))
                    .expect("re-merge");
            }
            prop_assert_eq!(store.manifest().len(), 3);
            store.close().expect("close");

            let reopened = ConsolidatedStore::open(&path, &schema).expect("final open");
            prop_assert_eq!(reopened.manifest().len(), 3);
            reopened.close().expect("close");
        }
    }
}

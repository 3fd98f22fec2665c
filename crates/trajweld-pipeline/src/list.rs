//! Fragment discovery.
//!
//! Fragments are discovered by probing sequence indices from zero: the raw
//! directory form wins over the archived form at the same index, and the
//! listing stops at the first index where neither form exists. Producers
//! append gap-free, so a gap means the tail is still being written (or was
//! abandoned); everything past it is excluded from this pass and picked up
//! by a later one. The listing is recomputed fresh on every pass.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use trajweld_error::Result;
use trajweld_types::{Fragment, FragmentEncoding};

/// List a unit's fragments in strictly increasing sequence order.
///
/// A missing or not-yet-created unit directory yields an empty listing.
/// When fragment forms exist beyond the gap that stopped the listing, a
/// warning names the gap; the return value is unaffected.
pub fn list_fragments(unit_path: &Path) -> Result<Vec<Fragment>> {
    if !unit_path.is_dir() {
        debug!(path = %unit_path.display(), "unit directory absent; empty listing");
        return Ok(Vec::new());
    }

    let mut fragments = Vec::new();
    let mut index = 0_u64;
    loop {
        if unit_path.join(Fragment::raw_dir_name(index)).is_dir() {
            fragments.push(Fragment::new(
                unit_path.to_path_buf(),
                index,
                FragmentEncoding::Raw,
            ));
        } else if unit_path.join(Fragment::archive_file_name(index)).is_file() {
            fragments.push(Fragment::new(
                unit_path.to_path_buf(),
                index,
                FragmentEncoding::Archived,
            ));
        } else {
            break;
        }
        index += 1;
    }

    if let Some(orphan) = first_orphan_index(unit_path, index)? {
        warn!(
            path = %unit_path.display(),
            gap_index = index,
            orphan_index = orphan,
            "fragment sequence has a gap; later fragments excluded from this pass"
        );
    }

    debug!(
        path = %unit_path.display(),
        fragments = fragments.len(),
        "listed fragments"
    );
    Ok(fragments)
}

/// Smallest fragment index at or above `stop` that still has a form on
/// disk, if any.
fn first_orphan_index(unit_path: &Path, stop: u64) -> Result<Option<u64>> {
    let mut orphan: Option<u64> = None;
    for entry in fs::read_dir(unit_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(found) = fragment_index_of(name) else {
            continue;
        };
        if found >= stop && orphan.is_none_or(|current| found < current) {
            orphan = Some(found);
        }
    }
    Ok(orphan)
}

/// Parse the sequence index out of a fragment form name, either `frag{N}`
/// or `frag-{N:03}.tar.gz`.
fn fragment_index_of(name: &str) -> Option<u64> {
    if let Some(rest) = name.strip_prefix("frag-") {
        return rest.strip_suffix(".tar.gz")?.parse().ok();
    }
    name.strip_prefix("frag")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn touch_raw(dir: &Path, index: u64) {
        fs::create_dir(dir.join(Fragment::raw_dir_name(index))).expect("create raw dir");
    }

    fn touch_archive(dir: &Path, index: u64) {
        File::create(dir.join(Fragment::archive_file_name(index))).expect("create archive file");
    }

    #[test]
    fn test_listing_stops_at_first_gap() {
        let dir = tempdir().expect("tempdir");
        touch_raw(dir.path(), 0);
        touch_raw(dir.path(), 1);
        touch_raw(dir.path(), 3);

        let fragments = list_fragments(dir.path()).expect("list");
        let indices: Vec<u64> = fragments.iter().map(|f| f.sequence_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_raw_form_wins_over_archive() {
        let dir = tempdir().expect("tempdir");
        touch_raw(dir.path(), 0);
        touch_archive(dir.path(), 0);

        let fragments = list_fragments(dir.path()).expect("list");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].encoding, FragmentEncoding::Raw);
    }

    #[test]
    fn test_mixed_forms_share_identity_scheme() {
        let dir = tempdir().expect("tempdir");
        touch_raw(dir.path(), 0);
        touch_archive(dir.path(), 1);
        touch_raw(dir.path(), 2);

        let fragments = list_fragments(dir.path()).expect("list");
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].encoding, FragmentEncoding::Raw);
        assert_eq!(fragments[1].encoding, FragmentEncoding::Archived);
        assert_eq!(fragments[2].encoding, FragmentEncoding::Raw);
        // The archived fragment's identity is still its raw directory path.
        assert_eq!(
            fragments[1].identity,
            dir.path().join("frag1").to_string_lossy()
        );
    }

    #[test]
    fn test_empty_and_missing_directories_list_empty() {
        let dir = tempdir().expect("tempdir");
        assert!(list_fragments(dir.path()).expect("list empty").is_empty());
        assert!(
            list_fragments(&dir.path().join("nope"))
                .expect("list missing")
                .is_empty()
        );
    }

    #[test]
    fn test_unrelated_entries_are_ignored() {
        let dir = tempdir().expect("tempdir");
        touch_raw(dir.path(), 0);
        File::create(dir.path().join("notes.txt")).expect("create file");
        fs::create_dir(dir.path().join("fragments")).expect("create dir");

        let fragments = list_fragments(dir.path()).expect("list");
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn test_orphan_detection_parses_both_forms() {
        assert_eq!(fragment_index_of("frag0"), Some(0));
        assert_eq!(fragment_index_of("frag12"), Some(12));
        assert_eq!(fragment_index_of("frag-007.tar.gz"), Some(7));
        assert_eq!(fragment_index_of("frag"), None);
        assert_eq!(fragment_index_of("frag-x.tar.gz"), None);
        assert_eq!(fragment_index_of("fragment"), None);
        assert_eq!(fragment_index_of("results-000.tar.gz"), None);
    }
}

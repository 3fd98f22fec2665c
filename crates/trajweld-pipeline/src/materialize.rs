//! Materialization of archived fragments into their raw on-disk form.
//!
//! Archived fragments are unpacked into a hidden staging directory inside the
//! unit directory, promoted with a single `rename`, and then verified frame by
//! frame against the fragment's own payload layout. A fragment directory only
//! ever becomes visible under its final name once its contents are complete,
//! so a crash mid-unpack leaves nothing behind except a stale staging
//! directory that the next pass sweeps away. The archive is the authoritative
//! copy until verification succeeds; deleting it afterwards is opt-in.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

use trajweld_error::{Result, WeldError};
use trajweld_types::{Fragment, FragmentEncoding, PAYLOAD_FILE_NAME};

use crate::codec::PayloadCodec;
use crate::decode::verify_payload;

/// Prefix for in-progress unpack directories inside a unit directory.
/// Anything carrying it belongs to no completed fragment and may be removed.
pub const STAGING_PREFIX: &str = ".twc-stage-";

/// What to do with archive members other than the payload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuxFileHandling {
    /// Unpack auxiliary files next to the payload.
    #[default]
    Keep,
    /// Skip auxiliary files; only the payload reaches the raw directory.
    Discard,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeOptions {
    /// Remove the source archive once the raw form has been verified.
    pub delete_archive: bool,
    pub aux_files: AuxFileHandling,
}

/// Ensure `fragment` exists in raw form and return the raw directory path.
///
/// Raw fragments pass through untouched. Archived fragments whose raw
/// directory already exists are not unpacked again. A freshly unpacked
/// fragment is verified end to end before this returns; on verification
/// failure the raw directory is removed again so the archive stays the
/// only copy.
pub fn materialize(
    fragment: &Fragment,
    codec: &dyn PayloadCodec,
    options: &MaterializeOptions,
) -> Result<PathBuf> {
    let raw_path = fragment.raw_path();
    if fragment.encoding == FragmentEncoding::Raw {
        return Ok(raw_path);
    }
    if raw_path.is_dir() {
        debug!(
            path = %raw_path.display(),
            "raw form already present, skipping unpack"
        );
        return Ok(raw_path);
    }

    sweep_stale_staging(&fragment.unit_path)?;

    let archive_path = fragment.archive_path();
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&fragment.unit_path)?;
    let raw_dir_name = Fragment::raw_dir_name(fragment.sequence_index);
    unpack_archive(&archive_path, staging.path(), &raw_dir_name, options.aux_files)?;

    let staged_raw = staging.path().join(&raw_dir_name);
    if !staged_raw.join(PAYLOAD_FILE_NAME).is_file() {
        return Err(archive_error(
            &archive_path,
            format!("missing {raw_dir_name}/{PAYLOAD_FILE_NAME} entry"),
        ));
    }

    if let Err(err) = fs::rename(&staged_raw, &raw_path) {
        // Another pass may have produced the raw form while we unpacked.
        if raw_path.is_dir() {
            debug!(
                path = %raw_path.display(),
                "raw form appeared during unpack, using it"
            );
            staging.close()?;
            return Ok(raw_path);
        }
        return Err(WeldError::Io(err));
    }
    staging.close()?;

    match verify_payload(&raw_path, &fragment.identity, codec) {
        Ok(frames) => {
            debug!(
                path = %raw_path.display(),
                frames,
                "materialized archived fragment"
            );
        }
        Err(err) => {
            // The unpacked copy failed verification and must not shadow the
            // archive on the next pass.
            if let Err(cleanup) = fs::remove_dir_all(&raw_path) {
                warn!(
                    path = %raw_path.display(),
                    error = %cleanup,
                    "failed to remove unverified fragment directory"
                );
            }
            return Err(err);
        }
    }

    if options.delete_archive {
        fs::remove_file(&archive_path)?;
        info!(
            path = %archive_path.display(),
            "deleted fragment archive after verified unpack"
        );
    }

    Ok(raw_path)
}

/// Remove leftover staging directories from interrupted earlier passes.
fn sweep_stale_staging(unit_path: &Path) -> Result<()> {
    for entry in fs::read_dir(unit_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(STAGING_PREFIX) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            warn!(path = %path.display(), "removing stale staging directory");
            fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}

fn unpack_archive(
    archive_path: &Path,
    staging_root: &Path,
    raw_dir_name: &str,
    aux_files: AuxFileHandling,
) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|err| archive_error(archive_path, format!("unreadable archive: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| archive_error(archive_path, format!("unreadable entry: {err}")))?;
        let entry_path = entry
            .path()
            .map_err(|err| archive_error(archive_path, format!("bad entry name: {err}")))?
            .into_owned();
        let Some(relative) = safe_relative_path(&entry_path) else {
            return Err(archive_error(
                archive_path,
                format!("unsafe entry path {}", entry_path.display()),
            ));
        };
        let mut components = relative.components();
        let Some(Component::Normal(first)) = components.next() else {
            continue;
        };
        if first != raw_dir_name {
            return Err(archive_error(
                archive_path,
                format!(
                    "entry {} outside fragment directory {raw_dir_name}",
                    entry_path.display()
                ),
            ));
        }
        let inner = components.as_path();

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(staging_root.join(&relative))?;
            }
            EntryType::Regular => {
                if aux_files == AuxFileHandling::Discard && inner != Path::new(PAYLOAD_FILE_NAME) {
                    debug!(entry = %entry_path.display(), "discarding auxiliary file");
                    continue;
                }
                let dest = staging_root.join(&relative);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest).map_err(|err| {
                    archive_error(
                        archive_path,
                        format!("failed to unpack {}: {err}", entry_path.display()),
                    )
                })?;
            }
            other => {
                return Err(archive_error(
                    archive_path,
                    format!(
                        "unsupported entry type {other:?} for {}",
                        entry_path.display()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn archive_error(path: &Path, detail: String) -> WeldError {
    WeldError::ArchiveFormat {
        path: path.to_path_buf(),
        detail,
    }
}

/// Normalize an archive entry path, rejecting anything that could escape
/// the staging directory.
fn safe_relative_path(entry_path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------

//! Projects-file parsing and expansion into consolidation units.
//!
//! A projects file is a TOML document with one `[[project]]` table per
//! simulation project. Each project names a source tree laid out as
//! `run{R}/clone{C}` unit directories, a topology JSON, and the atom
//! selection applied to every frame. Expansion re-reads the tree each time
//! it is called, so units that appear between iterations are picked up.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use trajweld_error::{Result, WeldError};
use trajweld_types::{ConsolidationUnit, Topology};

/// One `[[project]]` table in the projects file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    /// Directory holding `run{R}/clone{C}` unit directories.
    pub path: PathBuf,
    /// Topology JSON shared by every unit in this project.
    pub topology: PathBuf,
    /// Atom selection expression applied to every frame.
    pub selection: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsFile {
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectSpec>,
}

impl ProjectsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let file: Self = toml::from_str(&text).map_err(|err| {
            WeldError::config(format!("failed to parse {}: {err}", path.display()))
        })?;
        Ok(file)
    }

    /// Reject configurations that cannot produce a sound run, before any
    /// worker starts.
    pub fn validate(&self) -> Result<()> {
        if self.projects.is_empty() {
            return Err(WeldError::config("projects file lists no projects"));
        }
        let mut seen = HashSet::new();
        for project in &self.projects {
            if project.name.is_empty() {
                return Err(WeldError::config("project with an empty name"));
            }
            if !seen.insert(project.name.as_str()) {
                return Err(WeldError::config(format!(
                    "duplicate project name {}",
                    project.name
                )));
            }
            if !project.path.is_dir() {
                return Err(WeldError::config(format!(
                    "project {}: path {} is not a directory",
                    project.name,
                    project.path.display()
                )));
            }
            let topology = Topology::load(&project.topology).map_err(|err| {
                WeldError::config(format!(
                    "project {}: topology {}: {err}",
                    project.name,
                    project.topology.display()
                ))
            })?;
            topology.resolve(&project.selection).map_err(|err| {
                WeldError::config(format!(
                    "project {}: selection {:?}: {err}",
                    project.name, project.selection
                ))
            })?;
            debug!(project = %project.name, "project configuration validated");
        }
        Ok(())
    }

    /// Enumerate every `run{R}/clone{C}` directory of every project, in
    /// projects-file order and numeric run/clone order.
    pub fn expand_units(&self, outpath: &Path) -> Result<Vec<ConsolidationUnit>> {
        let mut units = Vec::new();
        for project in &self.projects {
            let before = units.len();
            expand_project(project, outpath, &mut units)?;
            info!(
                project = %project.name,
                units = units.len() - before,
                "expanded project into consolidation units"
            );
        }
        Ok(units)
    }
}

fn expand_project(
    project: &ProjectSpec,
    outpath: &Path,
    units: &mut Vec<ConsolidationUnit>,
) -> Result<()> {
    // Validated at startup; a tree deleted mid-run only empties the project.
    if !project.path.is_dir() {
        warn!(
            project = %project.name,
            path = %project.path.display(),
            "project path no longer exists, skipping"
        );
        return Ok(());
    }
    for (run, run_path) in numbered_dirs(&project.path, "run")? {
        for (clone, clone_path) in numbered_dirs(&run_path, "clone")? {
            units.push(ConsolidationUnit {
                project: project.name.clone(),
                unit_path: clone_path,
                container_path: outpath
                    .join(&project.name)
                    .join(format!("run{run}-clone{clone}.twc")),
                topology_path: project.topology.clone(),
                selection: project.selection.clone(),
            });
        }
    }
    Ok(())
}

/// Subdirectories named `{prefix}{N}`, sorted by `N`.
fn numbered_dirs(parent: &Path, prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = numeric_suffix(name, prefix) else {
            continue;
        };
        found.push((number, entry.path()));
    }
    found.sort_unstable();
    Ok(found)
}

fn numeric_suffix(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ---------------------------------------------------------------------------

//! Topology model and atom selection.
//!
//! A topology is a small JSON sidecar describing the frames a unit's
//! fragments contain: a name, the per-frame atom count, and named index
//! groups. A selection expression is a plain group lookup (`protein`) or its
//! complement (`not solvent`); there is deliberately no richer expression
//! language here. The resolved selection plus the topology identity form the
//! [`TopologySchema`] that containers record at creation and enforce on
//! every later open.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use trajweld_error::{Result, WeldError};

/// Parsed topology sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    /// Atoms per source frame.
    pub atom_count: u32,
    /// Named atom-index groups, each index in `0..atom_count`.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<u32>>,
}

impl Topology {
    /// Load and parse a topology JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let topology: Self = serde_json::from_str(&text).map_err(|err| WeldError::Config {
            detail: format!("topology {} is not valid JSON: {err}", path.display()),
        })?;
        if topology.atom_count == 0 {
            return Err(WeldError::Config {
                detail: format!("topology {} declares zero atoms", path.display()),
            });
        }
        Ok(topology)
    }

    /// Resolve a selection expression against this topology.
    ///
    /// Accepted forms: `<group>` and `not <group>`. The result is sorted,
    /// deduplicated, and non-empty; an unknown group, an out-of-range index
    /// in the referenced group, or a selection matching zero atoms is a
    /// configuration error.
    pub fn resolve(&self, expression: &str) -> Result<Selection> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(WeldError::Config {
                detail: format!("empty selection expression for topology '{}'", self.name),
            });
        }

        let (group_name, negate) = match trimmed.strip_prefix("not ") {
            Some(rest) if !rest.trim().is_empty() => (rest.trim(), true),
            Some(_) => {
                return Err(WeldError::Config {
                    detail: format!("selection '{trimmed}' names no group"),
                });
            }
            None => (trimmed, false),
        };

        let group = self.groups.get(group_name).ok_or_else(|| WeldError::Config {
            detail: format!(
                "selection group '{group_name}' not defined in topology '{}'",
                self.name
            ),
        })?;

        let mut member = vec![false; self.atom_count as usize];
        for &idx in group {
            if idx >= self.atom_count {
                return Err(WeldError::Config {
                    detail: format!(
                        "group '{group_name}' in topology '{}' references atom {idx} \
                         but the topology has only {} atoms",
                        self.name, self.atom_count
                    ),
                });
            }
            member[idx as usize] = true;
        }

        let atom_indices: Vec<u32> = (0..self.atom_count)
            .filter(|&idx| member[idx as usize] != negate)
            .collect();
        if atom_indices.is_empty() {
            return Err(WeldError::Config {
                detail: format!(
                    "selection '{trimmed}' matches zero atoms in topology '{}'",
                    self.name
                ),
            });
        }

        Ok(Selection {
            expression: trimmed.to_string(),
            atom_indices,
        })
    }
}

/// A resolved atom selection: the expression it came from plus the sorted,
/// deduplicated atom indices it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub expression: String,
    pub atom_indices: Vec<u32>,
}

impl Selection {
    /// Atoms per projected frame.
    #[must_use]
    pub fn atom_count(&self) -> u32 {
        self.atom_indices.len() as u32
    }

    /// xxh3 over the little-endian index list; schema fingerprint of the
    /// exact atom set, independent of how the expression was spelled.
    #[must_use]
    pub fn index_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(self.atom_indices.len() * 4);
        for idx in &self.atom_indices {
            bytes.extend_from_slice(&idx.to_le_bytes());
        }
        xxh3_64(&bytes)
    }
}

/// What a container records about the frames it holds. Written once at
/// creation; every later open must present an equal schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySchema {
    pub topology_name: String,
    pub source_atom_count: u32,
    pub selection_expression: String,
    pub selected_atom_count: u32,
    pub selection_hash: u64,
}

impl TopologySchema {
    #[must_use]
    pub fn from_parts(topology: &Topology, selection: &Selection) -> Self {
        Self {
            topology_name: topology.name.clone(),
            source_atom_count: topology.atom_count,
            selection_expression: selection.expression.clone(),
            selected_atom_count: selection.atom_count(),
            selection_hash: selection.index_hash(),
        }
    }

    /// Human-readable difference against a requested schema, or `None` when
    /// they match. Used to build `SchemaMismatch` details.
    #[must_use]
    pub fn mismatch_detail(&self, requested: &Self) -> Option<String> {
        if self == requested {
            return None;
        }
        let mut parts = Vec::new();
        if self.topology_name != requested.topology_name {
            parts.push(format!(
                "topology '{}' recorded, '{}' requested",
                self.topology_name, requested.topology_name
            ));
        }
        if self.source_atom_count != requested.source_atom_count {
            parts.push(format!(
                "{} source atoms recorded, {} requested",
                self.source_atom_count, requested.source_atom_count
            ));
        }
        if self.selection_expression != requested.selection_expression {
            parts.push(format!(
                "selection '{}' recorded, '{}' requested",
                self.selection_expression, requested.selection_expression
            ));
        }
        if self.selected_atom_count != requested.selected_atom_count
            || self.selection_hash != requested.selection_hash
        {
            parts.push(format!(
                "selected atom set differs ({} atoms, hash {:016x} recorded; \
                 {} atoms, hash {:016x} requested)",
                self.selected_atom_count,
                self.selection_hash,
                requested.selected_atom_count,
                requested.selection_hash
            ));
        }
        if parts.is_empty() {
            // PartialEq said unequal, so at least one branch must have fired.
            parts.push("schemas differ".to_string());
        }
        Some(parts.join("; "))
    }
}

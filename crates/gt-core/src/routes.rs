use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::BeadId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RoutesError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// RigInfo
// ---------------------------------------------------------------------------

/// A registered rig: a long-lived workspace owning one id prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigInfo {
    pub name: String,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// The authoritative prefix -> rig map, loaded from
/// `<town root>/.gastown/routes.json`.
///
/// Used for three things: resolving a bead's owning rig, choosing the CWD
/// for CWD-sensitive store calls, and the cross-rig guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Routes {
    prefixes: BTreeMap<String, RigInfo>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(town_root: &Path) -> Result<Self, RoutesError> {
        let path = Self::path_in(town_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| RoutesError::Io(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| RoutesError::Parse(e.to_string()))
    }

    pub fn path_in(town_root: &Path) -> PathBuf {
        town_root.join(".gastown").join("routes.json")
    }

    pub fn register(&mut self, prefix: impl Into<String>, rig: RigInfo) {
        self.prefixes.insert(prefix.into(), rig);
    }

    /// Resolve a bead id to its owning rig by longest registered prefix.
    ///
    /// A prefix `p` matches id `i` when `i` starts with `p-`.
    pub fn resolve(&self, id: &BeadId) -> Option<&RigInfo> {
        let mut best: Option<(&String, &RigInfo)> = None;
        for (prefix, rig) in &self.prefixes {
            if id.as_str().starts_with(&format!("{prefix}-")) {
                match best {
                    Some((b, _)) if b.len() >= prefix.len() => {}
                    _ => best = Some((prefix, rig)),
                }
            }
        }
        best.map(|(_, rig)| rig)
    }

    /// Resolved rig name for a bead id, or empty when unregistered.
    pub fn rig_name_for(&self, id: &BeadId) -> String {
        self.resolve(id).map(|r| r.name.clone()).unwrap_or_default()
    }

    pub fn rig_by_name(&self, name: &str) -> Option<&RigInfo> {
        self.prefixes.values().find(|r| r.name == name)
    }

    pub fn rigs(&self) -> impl Iterator<Item = &RigInfo> {
        self.prefixes.values()
    }

    pub fn is_known_rig(&self, name: &str) -> bool {
        self.rig_by_name(name).is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

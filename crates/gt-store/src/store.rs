use async_trait::async_trait;

use gt_core::types::{Bead, BeadId, BeadStatus, BeadType, DepEdge, EdgeType};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bead not found: {0}")]
    NotFound(BeadId),
    #[error("bd command failed: {0}")]
    Command(String),
    #[error("bd call timed out after {0}s")]
    Timeout(u64),
    #[error("unexpected bd output: {0}")]
    Json(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("formula not found: {0}")]
    NoFormula(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which physical store a creation targets. Reads and id-addressed writes
/// route by prefix instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreScope {
    /// The town-level store (convoys, sling contexts, rig identities).
    Town,
    /// A specific rig's store, by rig name.
    Rig(String),
}

// ---------------------------------------------------------------------------
// Write records
// ---------------------------------------------------------------------------

/// Fields for a bead creation. `id` is caller-assigned (convoy ids, sling
/// contexts); the store never invents ids for the dispatch core.
#[derive(Debug, Clone)]
pub struct NewBead {
    pub id: BeadId,
    pub title: String,
    pub bead_type: BeadType,
    pub status: BeadStatus,
    pub assignee: String,
    pub labels: Vec<String>,
    pub description: String,
}

impl NewBead {
    pub fn new(id: BeadId, title: impl Into<String>, bead_type: BeadType) -> Self {
        Self {
            id,
            title: title.into(),
            bead_type,
            status: BeadStatus::Open,
            assignee: String::new(),
            labels: Vec::new(),
            description: String::new(),
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct BeadPatch {
    pub status: Option<BeadStatus>,
    pub assignee: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl BeadPatch {
    pub fn status(status: BeadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assignee.is_none()
            && self.title.is_none()
            && self.description.is_none()
    }
}

/// Result of instantiating a formula onto a bead: the attached molecule and
/// the compound root that becomes the effective bead-to-hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoleculeBond {
    pub molecule: String,
    pub root: BeadId,
}

// ---------------------------------------------------------------------------
// BeadStore
// ---------------------------------------------------------------------------

/// Narrow contract the dispatch core consumes from the issue tracker.
///
/// Every write carries auto-commit semantics on the underlying storage.
/// Implementations must be safe to call concurrently; serialization happens
/// at the store level.
#[async_trait]
pub trait BeadStore: Send + Sync {
    /// Fetch one bead. `NotFound` when the id does not resolve.
    async fn show(&self, id: &BeadId) -> Result<Bead>;

    /// Existence check; may read stale data.
    async fn exists(&self, id: &BeadId) -> Result<bool>;

    /// Direct children via `parent-child` edges.
    async fn children(&self, id: &BeadId) -> Result<Vec<Bead>>;

    /// Outgoing dependency edges of one bead.
    async fn deps_out(&self, id: &BeadId) -> Result<Vec<DepEdge>>;

    /// Every convoy bead in the town store, regardless of status.
    async fn list_convoys(&self) -> Result<Vec<Bead>>;

    /// All beads of one type within a scope (used for sling contexts).
    async fn list_by_type(&self, scope: StoreScope, bead_type: &BeadType) -> Result<Vec<Bead>>;

    /// Bead ids tracked by a convoy.
    async fn tracked_beads(&self, convoy: &BeadId) -> Result<Vec<BeadId>>;

    async fn create_bead(&self, scope: StoreScope, new: NewBead) -> Result<()>;

    async fn update_bead(&self, id: &BeadId, patch: BeadPatch) -> Result<()>;

    async fn dep_add(&self, from: &BeadId, to: &BeadId, edge_type: &EdgeType) -> Result<()>;

    async fn dep_remove(&self, from: &BeadId, to: &BeadId, edge_type: &EdgeType) -> Result<()>;

    async fn label_add(&self, id: &BeadId, label: &str) -> Result<()>;

    async fn label_remove(&self, id: &BeadId, label: &str) -> Result<()>;

    // --- formula / molecule operations -------------------------------------

    async fn formula_exists(&self, name: &str) -> Result<bool>;

    /// Prepare a formula. Pure preparation; repeatable.
    async fn cook_formula(&self, name: &str) -> Result<()>;

    /// Bond a cooked formula onto a bead with the given variable bindings.
    async fn instantiate_formula(
        &self,
        bead: &BeadId,
        formula: &str,
        vars: &[(String, String)],
    ) -> Result<MoleculeBond>;

    /// Delete a molecule and unlink it from the bead.
    async fn burn_molecule(&self, molecule: &str, bead: &BeadId) -> Result<()>;

    /// Molecule ids currently attached to a bead.
    async fn attached_molecules(&self, bead: &BeadId) -> Result<Vec<String>>;
}

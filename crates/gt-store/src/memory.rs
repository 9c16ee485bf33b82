use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use gt_core::types::{Bead, BeadId, BeadStatus, BeadType, DepEdge, EdgeClass, EdgeType};

use crate::store::{
    BeadPatch, BeadStore, MoleculeBond, NewBead, Result, StoreError, StoreScope,
};

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory [`BeadStore`] used by tests and dry runs.
///
/// Semantics mirror `BdCli`: hierarchy edges run child -> parent, execution
/// edges run blocked -> blocker, `tracks` edges run convoy -> member. Every
/// mutation is appended to an op log so tests can assert external ordering.
#[derive(Default)]
pub struct MemStore {
    beads: Mutex<BTreeMap<BeadId, Bead>>,
    deps: Mutex<Vec<DepEdge>>,
    molecules: Mutex<BTreeMap<BeadId, Vec<String>>>,
    formulas: Mutex<BTreeSet<String>>,
    ops: Mutex<Vec<String>>,
    mol_counter: AtomicU64,
    /// When set, every list/read errors -- exercises fail-closed paths.
    pub fail_reads: AtomicBool,
    /// When set, the next `update_bead` of this id errors.
    pub fail_update_of: Mutex<Option<BeadId>>,
    pub fail_cook: AtomicBool,
    pub fail_instantiate: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bead: Bead) {
        self.beads.lock().expect("beads lock").insert(bead.id.clone(), bead);
    }

    /// Convenience bead constructor for tests.
    pub fn put_simple(&self, id: &str, bead_type: BeadType, status: BeadStatus, rig: &str) {
        self.put(Bead {
            id: BeadId::from(id),
            title: format!("bead {id}"),
            bead_type,
            status,
            assignee: String::new(),
            labels: Vec::new(),
            description: String::new(),
            rig: rig.to_string(),
        });
    }

    pub fn link(&self, from: &str, to: &str, edge_type: EdgeType) {
        self.deps.lock().expect("deps lock").push(DepEdge {
            from: BeadId::from(from),
            to: BeadId::from(to),
            edge_type,
        });
    }

    pub fn add_formula(&self, name: &str) {
        self.formulas.lock().expect("formulas lock").insert(name.to_string());
    }

    pub fn attach_molecule(&self, bead: &str, molecule: &str) {
        self.molecules
            .lock()
            .expect("molecules lock")
            .entry(BeadId::from(bead))
            .or_default()
            .push(molecule.to_string());
    }

    pub fn get(&self, id: &BeadId) -> Option<Bead> {
        self.beads.lock().expect("beads lock").get(id).cloned()
    }

    pub fn op_log(&self) -> Vec<String> {
        self.ops.lock().expect("ops lock").clone()
    }

    /// Append an external-side marker (branch/session calls) so tests can
    /// assert cross-component ordering in one log.
    pub fn note(&self, op: impl Into<String>) {
        self.record(op.into());
    }

    pub fn edges(&self) -> Vec<DepEdge> {
        self.deps.lock().expect("deps lock").clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().expect("ops lock").push(op);
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Command("simulated read outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BeadStore for MemStore {
    async fn show(&self, id: &BeadId) -> Result<Bead> {
        self.check_reads()?;
        self.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn exists(&self, id: &BeadId) -> Result<bool> {
        self.check_reads()?;
        Ok(self.get(id).is_some())
    }

    async fn children(&self, id: &BeadId) -> Result<Vec<Bead>> {
        self.check_reads()?;
        let deps = self.deps.lock().expect("deps lock");
        let beads = self.beads.lock().expect("beads lock");
        let mut out = Vec::new();
        for edge in deps.iter() {
            if edge.edge_type.class() == EdgeClass::Hierarchy && edge.to == *id {
                if let Some(child) = beads.get(&edge.from) {
                    out.push(child.clone());
                }
            }
        }
        Ok(out)
    }

    async fn deps_out(&self, id: &BeadId) -> Result<Vec<DepEdge>> {
        self.check_reads()?;
        Ok(self
            .deps
            .lock()
            .expect("deps lock")
            .iter()
            .filter(|e| e.from == *id)
            .cloned()
            .collect())
    }

    async fn list_convoys(&self) -> Result<Vec<Bead>> {
        self.check_reads()?;
        Ok(self
            .beads
            .lock()
            .expect("beads lock")
            .values()
            .filter(|b| b.bead_type == BeadType::Convoy)
            .cloned()
            .collect())
    }

    async fn list_by_type(&self, _scope: StoreScope, bead_type: &BeadType) -> Result<Vec<Bead>> {
        self.check_reads()?;
        Ok(self
            .beads
            .lock()
            .expect("beads lock")
            .values()
            .filter(|b| b.bead_type == *bead_type)
            .cloned()
            .collect())
    }

    async fn tracked_beads(&self, convoy: &BeadId) -> Result<Vec<BeadId>> {
        self.check_reads()?;
        Ok(self
            .deps
            .lock()
            .expect("deps lock")
            .iter()
            .filter(|e| e.from == *convoy && e.edge_type == EdgeType::Tracks)
            .map(|e| e.to.clone())
            .collect())
    }

    async fn create_bead(&self, _scope: StoreScope, new: NewBead) -> Result<()> {
        self.record(format!("create {} type={}", new.id, new.bead_type.as_str()));
        self.put(Bead {
            id: new.id,
            title: new.title,
            bead_type: new.bead_type,
            status: new.status,
            assignee: new.assignee,
            labels: new.labels,
            description: new.description,
            rig: String::new(),
        });
        Ok(())
    }

    async fn update_bead(&self, id: &BeadId, patch: BeadPatch) -> Result<()> {
        {
            let mut fail = self.fail_update_of.lock().expect("fail lock");
            if fail.as_ref() == Some(id) {
                *fail = None;
                return Err(StoreError::Command("simulated update failure".into()));
            }
        }
        let mut beads = self.beads.lock().expect("beads lock");
        let bead = beads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let mut parts = Vec::new();
        if let Some(status) = patch.status {
            parts.push(format!("status={}", status.as_str()));
            bead.status = status;
        }
        if let Some(assignee) = patch.assignee {
            parts.push(format!("assignee={assignee}"));
            bead.assignee = assignee;
        }
        if let Some(title) = patch.title {
            parts.push("title".to_string());
            bead.title = title;
        }
        if let Some(description) = patch.description {
            parts.push("description".to_string());
            bead.description = description;
        }
        drop(beads);
        self.record(format!("update {id} {}", parts.join(" ")));
        Ok(())
    }

    async fn dep_add(&self, from: &BeadId, to: &BeadId, edge_type: &EdgeType) -> Result<()> {
        self.record(format!("dep_add {from} {to} {}", edge_type.as_str()));
        self.deps.lock().expect("deps lock").push(DepEdge {
            from: from.clone(),
            to: to.clone(),
            edge_type: edge_type.clone(),
        });
        Ok(())
    }

    async fn dep_remove(&self, from: &BeadId, to: &BeadId, edge_type: &EdgeType) -> Result<()> {
        self.record(format!("dep_remove {from} {to} {}", edge_type.as_str()));
        self.deps
            .lock()
            .expect("deps lock")
            .retain(|e| !(e.from == *from && e.to == *to && e.edge_type == *edge_type));
        Ok(())
    }

    async fn label_add(&self, id: &BeadId, label: &str) -> Result<()> {
        self.record(format!("label_add {id} {label}"));
        let mut beads = self.beads.lock().expect("beads lock");
        let bead = beads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if !bead.labels.iter().any(|l| l == label) {
            bead.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn label_remove(&self, id: &BeadId, label: &str) -> Result<()> {
        self.record(format!("label_remove {id} {label}"));
        let mut beads = self.beads.lock().expect("beads lock");
        let bead = beads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        bead.labels.retain(|l| l != label);
        Ok(())
    }

    async fn formula_exists(&self, name: &str) -> Result<bool> {
        self.check_reads()?;
        Ok(self.formulas.lock().expect("formulas lock").contains(name))
    }

    async fn cook_formula(&self, name: &str) -> Result<()> {
        if self.fail_cook.load(Ordering::SeqCst) {
            return Err(StoreError::Command("simulated cook failure".into()));
        }
        if !self.formulas.lock().expect("formulas lock").contains(name) {
            return Err(StoreError::NoFormula(name.to_string()));
        }
        self.record(format!("cook {name}"));
        Ok(())
    }

    async fn instantiate_formula(
        &self,
        bead: &BeadId,
        formula: &str,
        vars: &[(String, String)],
    ) -> Result<MoleculeBond> {
        if self.fail_instantiate.load(Ordering::SeqCst) {
            return Err(StoreError::Command("simulated instantiate failure".into()));
        }
        let n = self.mol_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let molecule = format!("mol-{n:04}");
        self.record(format!(
            "instantiate {formula} on {bead} vars={}",
            vars.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        ));
        self.molecules
            .lock()
            .expect("molecules lock")
            .entry(bead.clone())
            .or_default()
            .push(molecule.clone());
        Ok(MoleculeBond {
            molecule,
            root: bead.clone(),
        })
    }

    async fn burn_molecule(&self, molecule: &str, bead: &BeadId) -> Result<()> {
        self.record(format!("burn {molecule} from {bead}"));
        if let Some(mols) = self.molecules.lock().expect("molecules lock").get_mut(bead) {
            mols.retain(|m| m != molecule);
        }
        Ok(())
    }

    async fn attached_molecules(&self, bead: &BeadId) -> Result<Vec<String>> {
        self.check_reads()?;
        Ok(self
            .molecules
            .lock()
            .expect("molecules lock")
            .get(bead)
            .cloned()
            .unwrap_or_default())
    }
}

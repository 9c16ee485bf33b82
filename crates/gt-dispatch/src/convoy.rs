use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use gt_core::types::{BeadId, BeadStatus, BeadType, EdgeType, StageStatus, Wave};
use gt_store::{BeadPatch, BeadStore, NewBead, StoreError, StoreScope};

use crate::collect::{collect, CollectError, StageInput};
use crate::dag::ConvoyDag;
use crate::guards::{availability_map, GuardError};
use crate::sling::{SlingExecutor, SlingOutcome, SlingParams};
use crate::waves::{plan_waves, WaveError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConvoyError {
    #[error("{0} is not a convoy")]
    NotAConvoy(BeadId),
    #[error("convoy {0} is {status}; only staged convoys can launch", status = .1.as_str())]
    NotLaunchable(BeadId, BeadStatus),
    #[error("convoy {0} was staged with warnings; launch it with --force")]
    WarningsNeedForce(BeadId),
    #[error("{0} overlaps open convoy {1}; close it first")]
    OverlapWithOpen(String, BeadId),
    #[error("staged beads overlap multiple convoys ({}); re-stage one of them explicitly", ids_csv(.0))]
    OverlapAmbiguous(Vec<BeadId>),
    #[error("blocked rigs: {0}")]
    BlockedRigs(String),
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Wave(#[from] WaveError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ConvoyError>;

fn ids_csv(ids: &[BeadId]) -> String {
    ids.iter()
        .map(|i| i.as_str().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Ids and titles
// ---------------------------------------------------------------------------

/// Fresh convoy id: `hq-cv-` plus five random lowercase characters.
pub fn new_convoy_id() -> BeadId {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
        .collect();
    BeadId::new(format!("hq-cv-{suffix}"))
}

/// Title precedence: explicit override, then the epic's title, then the
/// generic summary.
fn compose_title(explicit: Option<&str>, epic_title: Option<&str>, dag: &ConvoyDag) -> String {
    if let Some(t) = explicit {
        return t.to_string();
    }
    if let Some(t) = epic_title {
        return format!("Staged: {t}");
    }
    let beads = dag.slingable_ids().len();
    let rigs = dag.rig_counts().len();
    format!("Staged: {beads} beads across {rigs} rigs")
}

fn stage_status_to_bead(status: StageStatus) -> BeadStatus {
    match status {
        StageStatus::StagedWarnings => BeadStatus::StagedWarnings,
        _ => BeadStatus::StagedReady,
    }
}

// ---------------------------------------------------------------------------
// Overlap detection
// ---------------------------------------------------------------------------

/// Result of scanning live convoys for tracked-set overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlap {
    /// Create a fresh convoy.
    Fresh,
    /// Exactly one staged convoy overlaps: re-stage it in place.
    Restage(BeadId),
}

// ---------------------------------------------------------------------------
// ConvoyRegistry
// ---------------------------------------------------------------------------

/// Creates, re-stages, and launches convoys in the town store.
pub struct ConvoyRegistry {
    store: Arc<dyn BeadStore>,
}

impl ConvoyRegistry {
    pub fn new(store: Arc<dyn BeadStore>) -> Self {
        Self { store }
    }

    /// Write a fresh convoy: the create, then one `tracks` edge per
    /// slingable bead in sorted id order, each write auto-committed.
    pub async fn create(
        &self,
        dag: &ConvoyDag,
        status: StageStatus,
        title: Option<&str>,
        epic_title: Option<&str>,
    ) -> Result<BeadId> {
        let id = new_convoy_id();
        let mut new = NewBead::new(id.clone(), compose_title(title, epic_title, dag), BeadType::Convoy);
        new.status = stage_status_to_bead(status);
        new.description = format!("Staged at {}", Utc::now().to_rfc3339());
        self.store.create_bead(StoreScope::Town, new).await?;

        for bead in dag.slingable_ids() {
            self.store.dep_add(&id, &bead, &EdgeType::Tracks).await?;
        }

        info!(convoy = %id, "convoy created");
        Ok(id)
    }

    /// Update-in-place: reconcile the tracked set against the new DAG, then
    /// refresh status, title, and the re-staged timestamp.
    pub async fn restage(
        &self,
        convoy: &BeadId,
        dag: &ConvoyDag,
        status: StageStatus,
        title: Option<&str>,
    ) -> Result<()> {
        let current: BTreeSet<BeadId> = self.store.tracked_beads(convoy).await?.into_iter().collect();
        let desired: BTreeSet<BeadId> = dag.slingable_ids().into_iter().collect();

        for added in desired.difference(&current) {
            self.store.dep_add(convoy, added, &EdgeType::Tracks).await?;
        }
        for stale in current.difference(&desired) {
            self.store.dep_remove(convoy, stale, &EdgeType::Tracks).await?;
        }

        let patch = BeadPatch {
            status: Some(stage_status_to_bead(status)),
            title: title.map(|t| t.to_string()),
            description: Some(format!("Re-staged at {}", Utc::now().to_rfc3339())),
            ..BeadPatch::default()
        };
        self.store.update_bead(convoy, patch).await?;

        info!(convoy = %convoy, added = desired.difference(&current).count(),
              removed = current.difference(&desired).count(), "convoy re-staged");
        Ok(())
    }

    /// Scan every staged or open convoy for overlap with the to-be-staged
    /// slingable set. Open overlap is fatal; exactly one staged overlap
    /// re-stages in place; more than one is ambiguous.
    pub async fn detect_overlap(&self, slingable: &[BeadId]) -> Result<Overlap> {
        let wanted: BTreeSet<&BeadId> = slingable.iter().collect();
        let mut staged_hits: Vec<BeadId> = Vec::new();

        let mut convoys = self.store.list_convoys().await?;
        convoys.sort_by(|a, b| a.id.cmp(&b.id));

        for convoy in convoys {
            let live = matches!(
                convoy.status,
                BeadStatus::Open | BeadStatus::StagedReady | BeadStatus::StagedWarnings
            );
            if !live {
                continue;
            }
            let tracked = self.store.tracked_beads(&convoy.id).await?;
            let overlap = tracked.iter().filter(|t| wanted.contains(t)).count();
            if overlap == 0 {
                continue;
            }
            if convoy.status == BeadStatus::Open {
                return Err(ConvoyError::OverlapWithOpen(
                    format!("{overlap} staged beads"),
                    convoy.id,
                ));
            }
            staged_hits.push(convoy.id);
        }

        match staged_hits.len() {
            0 => Ok(Overlap::Fresh),
            1 => Ok(Overlap::Restage(staged_hits.remove(0))),
            _ => Err(ConvoyError::OverlapAmbiguous(staged_hits)),
        }
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Transition a staged convoy to open and dispatch exactly Wave 1.
    ///
    /// `staged_ready` launches unconditionally; `staged_warnings` needs
    /// force; open and closed are rejected. Individual Wave 1 failures do
    /// not abort sibling dispatches; later waves belong to reconciliation.
    pub async fn launch(
        &self,
        executor: &SlingExecutor,
        convoy: &BeadId,
        force: bool,
    ) -> Result<LaunchReport> {
        let bead = self.store.show(convoy).await?;
        if bead.bead_type != BeadType::Convoy {
            return Err(ConvoyError::NotAConvoy(convoy.clone()));
        }
        match bead.status {
            BeadStatus::StagedReady => {}
            BeadStatus::StagedWarnings => {
                if !force {
                    return Err(ConvoyError::WarningsNeedForce(convoy.clone()));
                }
            }
            other => return Err(ConvoyError::NotLaunchable(convoy.clone(), other)),
        }

        let env = executor.env();
        let collected = collect(
            self.store.as_ref(),
            &env.routes,
            &StageInput::Convoy(convoy.clone()),
        )
        .await?;
        let dag = ConvoyDag::build(&collected.beads, &collected.deps);
        let waves = plan_waves(&dag)?;

        // Aggregate every blocked target rig before anything transitions.
        let availability =
            availability_map(self.store.as_ref(), &env.routes, dag.rig_counts().into_keys())
                .await?;
        let mut blocked: BTreeMap<String, Vec<BeadId>> = BTreeMap::new();
        for id in dag.slingable_ids() {
            let node = dag.node(&id).expect("id from dag");
            if availability
                .get(&node.rig)
                .is_some_and(|state| state.is_blocked())
            {
                blocked.entry(node.rig.clone()).or_default().push(id);
            }
        }
        let mut blocked_warning = None;
        if !blocked.is_empty() {
            let rendered = blocked
                .iter()
                .map(|(rig, ids)| format!("{rig}: [{}]", ids_csv(ids)))
                .collect::<Vec<_>>()
                .join("; ");
            if !force {
                return Err(ConvoyError::BlockedRigs(rendered));
            }
            warn!(convoy = %convoy, "launching over blocked rigs: {rendered}");
            blocked_warning = Some(rendered);
        }

        self.store
            .update_bead(convoy, BeadPatch::status(BeadStatus::Open))
            .await?;

        let delay = Duration::from_millis(env.config.dispatch.inter_spawn_delay_ms);
        let mut dispatched = Vec::new();
        if let Some(first) = waves.first() {
            for (n, task) in first.tasks.iter().enumerate() {
                if n > 0 {
                    tokio::time::sleep(delay).await;
                }
                let rig = dag
                    .node(task)
                    .map(|node| node.rig.clone())
                    .unwrap_or_default();
                let mut params = SlingParams::batch_member(task.clone(), rig);
                params.no_convoy = true;
                params.caller = "convoy-launch".into();
                params.force = force;
                match executor.execute_sling(&params).await {
                    Ok(outcome) => dispatched.push(outcome),
                    Err(e) => dispatched.push(SlingOutcome {
                        bead_id: task.clone(),
                        polecat: String::new(),
                        success: false,
                        err_msg: e.to_string(),
                        attached_molecule: None,
                    }),
                }
            }
        }

        info!(convoy = %convoy, wave1 = dispatched.len(), "convoy launched");
        Ok(LaunchReport {
            convoy: convoy.clone(),
            waves,
            dispatched,
            blocked_warning,
        })
    }
}

/// What a launch returns: the computed wave plan, per-task Wave 1 results,
/// and any forced-through blocked-rig warning.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LaunchReport {
    pub convoy: BeadId,
    pub waves: Vec<Wave>,
    pub dispatched: Vec<SlingOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_warning: Option<String>,
}

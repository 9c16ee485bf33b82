use std::sync::Arc;

use tracing::info;

use gt_core::env::TownEnv;
use gt_core::types::{BeadId, BeadStatus, BeadType, StageResult, StageStatus};
use gt_store::{BeadStore, StoreError};

use crate::collect::{classify_input, collect, CollectError, StageInput};
use crate::convoy::{ConvoyError, ConvoyRegistry, Overlap};
use crate::dag::ConvoyDag;
use crate::guards::{availability_map, GuardError};
use crate::validate::{error_checks, warning_checks, Validation};
use crate::waves::{plan_waves, WaveError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Wave(#[from] WaveError),
    #[error(transparent)]
    Convoy(#[from] ConvoyError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("convoy {0} is {status}; only staged convoys can be re-staged", status = .1.as_str())]
    ConvoyNotRestageable(BeadId, BeadStatus),
    #[error("staging failed validation; nothing to launch")]
    NothingToLaunch,
}

pub type Result<T> = std::result::Result<T, StageError>;

// ---------------------------------------------------------------------------
// Stager
// ---------------------------------------------------------------------------

/// Options for one staging run.
#[derive(Debug, Clone, Default)]
pub struct StageOpts {
    pub title: Option<String>,
}

/// The staging/launch engine front door: turns a user-supplied bead set
/// into a validated DAG, a wave schedule, and a staged convoy.
pub struct Stager {
    store: Arc<dyn BeadStore>,
    env: TownEnv,
}

impl Stager {
    pub fn new(env: TownEnv, store: Arc<dyn BeadStore>) -> Self {
        Self { store, env }
    }

    /// Stage a set of ids (epic, task list, or existing convoy).
    ///
    /// Fatal findings return a `StageResult` with status `error` and no
    /// convoy; otherwise the convoy is created or re-staged and the wave
    /// plan returned.
    pub async fn stage(&self, ids: &[BeadId], opts: &StageOpts) -> Result<StageResult> {
        let input = classify_input(self.store.as_ref(), ids).await?;
        let collected = collect(self.store.as_ref(), &self.env.routes, &input).await?;
        let dag = ConvoyDag::build(&collected.beads, &collected.deps);

        // Error pass blocks everything downstream.
        let errors = error_checks(&dag);
        if !errors.is_empty() {
            return Ok(StageResult {
                status: StageStatus::Error,
                convoy_id: None,
                restaged: false,
                errors,
                warnings: Vec::new(),
                waves: Vec::new(),
            });
        }

        let waves = plan_waves(&dag)?;

        let availability = availability_map(
            self.store.as_ref(),
            &self.env.routes,
            dag.rig_counts().into_keys(),
        )
        .await?;
        let warnings = warning_checks(
            &dag,
            input.is_epic(),
            &waves,
            &availability,
            self.env.config.dispatch.wave_capacity_warning,
        );

        let validation = Validation {
            errors: Vec::new(),
            warnings,
        };
        let status = validation.stage_status();

        let registry = ConvoyRegistry::new(Arc::clone(&self.store));
        let epic_title = match &input {
            StageInput::Epic(id) => dag.node(id).map(|n| n.title.clone()),
            _ => None,
        };

        let (convoy_id, restaged) = match &input {
            StageInput::Convoy(id) => {
                let convoy = self.store.show(id).await?;
                if !convoy.status.is_launchable() {
                    return Err(StageError::ConvoyNotRestageable(id.clone(), convoy.status));
                }
                registry
                    .restage(id, &dag, status, opts.title.as_deref())
                    .await?;
                (id.clone(), true)
            }
            _ => match registry.detect_overlap(&dag.slingable_ids()).await? {
                Overlap::Restage(existing) => {
                    registry
                        .restage(&existing, &dag, status, opts.title.as_deref())
                        .await?;
                    (existing, true)
                }
                Overlap::Fresh => {
                    let id = registry
                        .create(&dag, status, opts.title.as_deref(), epic_title.as_deref())
                        .await?;
                    (id, false)
                }
            },
        };

        info!(
            convoy = %convoy_id,
            restaged,
            waves = waves.len(),
            status = ?status,
            "staging complete"
        );

        Ok(StageResult {
            status,
            convoy_id: Some(convoy_id),
            restaged,
            errors: Vec::new(),
            warnings: validation.warnings,
            waves,
        })
    }

    /// Resolve a launch target: a convoy id launches directly; an epic or
    /// task list is staged first (reusing any overlapping staged convoy).
    pub async fn resolve_launch_target(&self, ids: &[BeadId]) -> Result<BeadId> {
        if ids.len() == 1 {
            if let Ok(bead) = self.store.show(&ids[0]).await {
                if bead.bead_type == BeadType::Convoy {
                    return Ok(bead.id);
                }
            }
        }
        let result = self.stage(ids, &StageOpts::default()).await?;
        result.convoy_id.ok_or(StageError::NothingToLaunch)
    }
}

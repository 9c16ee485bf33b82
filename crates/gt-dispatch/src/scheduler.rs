use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use gt_core::env::TownEnv;
use gt_core::events::{EventFeed, FeedEvent, FeedEventKind};
use gt_core::types::{BeadId, BeadStatus, BeadType, SlingContext};
use gt_store::context::{close_context, create_context, open_contexts};
use gt_store::{BeadStore, NewBead, StoreError, StoreScope};

use crate::collect::{collect, CollectError, StageInput};
use crate::convoy::new_convoy_id;
use crate::dag::ConvoyDag;
use crate::guards::{check_cross_rig, GuardError};
use crate::sling::{SlingExecutor, SlingOutcome, SlingParams};
use crate::waves::{plan_waves, WaveError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("bead not found: {0}")]
    NotFound(BeadId),
    #[error("unknown rig: {0}")]
    UnknownRig(String),
    #[error("{0} is {status}; pass --force to schedule it anyway", status = .1.as_str())]
    HookedOrPinned(BeadId, BeadStatus),
    #[error("formula not found: {0}")]
    NoFormula(String),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Outcome of a schedule call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleOutcome {
    /// `None` for dry runs, which stop before any write.
    pub context_id: Option<BeadId>,
    /// `true` when an open context already covered the bead (no-op).
    pub already_scheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convoy: Option<BeadId>,
}

/// Capacity-aware front door for slings: with `max_polecats > 0` requests
/// become persistent sling contexts drained by the [`Dispatcher`]; callers
/// with `max_polecats <= 0` should go straight to the executor.
pub struct Scheduler {
    store: Arc<dyn BeadStore>,
    env: TownEnv,
    feed: EventFeed,
}

impl Scheduler {
    pub fn new(env: TownEnv, store: Arc<dyn BeadStore>) -> Self {
        let feed = EventFeed::new(&env.town_root);
        Self { store, env, feed }
    }

    /// Enqueue one `(bead, rig)` for deferred dispatch.
    ///
    /// Idempotent: an existing open context for the bead is reported as a
    /// no-op. Any failure while reading open contexts fails the call --
    /// never silently enqueues a duplicate.
    pub async fn schedule(
        &self,
        bead_id: &BeadId,
        rig: &str,
        mut ctx: SlingContext,
        force: bool,
        dry_run: bool,
    ) -> Result<ScheduleOutcome> {
        // 1. Validation: bead exists, rig is known, cross-rig guard.
        if !self.store.exists(bead_id).await? {
            return Err(ScheduleError::NotFound(bead_id.clone()));
        }
        if !self.env.routes.is_known_rig(rig) {
            return Err(ScheduleError::UnknownRig(rig.to_string()));
        }
        check_cross_rig(&self.env.routes, bead_id, rig, force)?;

        // 2. Idempotency -- fail fast on any read error.
        let contexts = open_contexts(self.store.as_ref()).await?;
        if let Some((ctx_id, existing)) = contexts.iter().find(|(_, c)| c.work_bead == *bead_id) {
            info!(bead = %bead_id, context = %ctx_id, "already scheduled; no-op");
            return Ok(ScheduleOutcome {
                context_id: Some(ctx_id.clone()),
                already_scheduled: true,
                convoy: existing.convoy.clone(),
            });
        }

        // 3. Status gate.
        let bead = self.store.show(bead_id).await?;
        if matches!(bead.status, BeadStatus::Hooked | BeadStatus::Pinned) && !force {
            return Err(ScheduleError::HookedOrPinned(bead.id, bead.status));
        }

        // 4. Formula existence + pre-cook. Dry runs stop before the cook.
        if let Some(formula) = &ctx.formula {
            if !self.store.formula_exists(formula).await? {
                return Err(ScheduleError::NoFormula(formula.clone()));
            }
            if dry_run {
                return Ok(ScheduleOutcome {
                    context_id: None,
                    already_scheduled: false,
                    convoy: None,
                });
            }
            self.store.cook_formula(formula).await?;
        } else if dry_run {
            return Ok(ScheduleOutcome {
                context_id: None,
                already_scheduled: false,
                convoy: None,
            });
        }

        // 5. Create the context bead -- a single atomic write.
        ctx.work_bead = bead_id.clone();
        ctx.target_rig = rig.to_string();
        let context_id = create_context(self.store.as_ref(), &ctx).await?;

        // 6. Auto-convoy, linked back into the context.
        let convoy = match self.ensure_convoy(&bead).await {
            Ok(convoy) => {
                if let Some(convoy_id) = &convoy {
                    ctx.convoy = Some(convoy_id.clone());
                    let patch = gt_store::BeadPatch {
                        description: Some(gt_store::context::encode_context(&ctx, &[])),
                        ..gt_store::BeadPatch::default()
                    };
                    self.store.update_bead(&context_id, patch).await?;
                }
                convoy
            }
            Err(e) => {
                warn!(bead = %bead_id, error = %e, "auto-convoy skipped");
                None
            }
        };

        self.feed.emit(FeedEvent::new(
            FeedEventKind::SchedulerEnqueue,
            "scheduler",
            serde_json::json!({
                "bead": bead_id,
                "rig": rig,
                "context": context_id,
            }),
        ));

        info!(bead = %bead_id, rig, context = %context_id, "sling scheduled");
        Ok(ScheduleOutcome {
            context_id: Some(context_id),
            already_scheduled: false,
            convoy,
        })
    }

    /// The subset of `ids` with an open sling context.
    ///
    /// Fails closed: on any internal error the whole query set is reported
    /// as scheduled, so a transiently-blind caller cannot double-enqueue.
    pub async fn are_scheduled(&self, ids: &[BeadId]) -> Vec<BeadId> {
        match open_contexts(self.store.as_ref()).await {
            Ok(contexts) => ids
                .iter()
                .filter(|id| contexts.iter().any(|(_, c)| c.work_bead == **id))
                .cloned()
                .collect(),
            Err(e) => {
                warn!(error = %e, "context read failed; treating all queried beads as scheduled");
                ids.to_vec()
            }
        }
    }

    /// Cancel an open context.
    pub async fn cancel(&self, context_id: &BeadId) -> Result<()> {
        close_context(self.store.as_ref(), context_id).await?;
        Ok(())
    }

    /// Track the bead with a fresh single-issue convoy when nothing tracks
    /// it yet.
    async fn ensure_convoy(&self, bead: &gt_core::types::Bead) -> Result<Option<BeadId>> {
        for convoy in self.store.list_convoys().await? {
            if convoy.status.is_terminal() {
                continue;
            }
            if self.store.tracked_beads(&convoy.id).await?.contains(&bead.id) {
                return Ok(Some(convoy.id));
            }
        }
        let convoy = new_convoy_id();
        let mut new = NewBead::new(
            convoy.clone(),
            format!("Convoy: {}", bead.title),
            BeadType::Convoy,
        );
        new.status = BeadStatus::Open;
        self.store.create_bead(StoreScope::Town, new).await?;
        self.store
            .dep_add(&convoy, &bead.id, &gt_core::types::EdgeType::Tracks)
            .await?;
        Ok(Some(convoy))
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Per-context result of a dispatcher drain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchReport {
    pub context_id: BeadId,
    pub outcome: SlingOutcome,
}

/// Drains open sling contexts subject to global and per-rig concurrency.
///
/// The cross-rig guard is skipped here: the context's routing was validated
/// at enqueue time and the prefix map entry for an id never changes.
pub struct Dispatcher {
    executor: SlingExecutor,
}

impl Dispatcher {
    pub fn new(executor: SlingExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &SlingExecutor {
        &self.executor
    }

    /// One drain pass: pick open contexts (oldest first) up to the global
    /// cap, at most `max_per_rig` per rig, and run each sling. Successful
    /// dispatches close their context; failures leave it open for the next
    /// pass.
    pub async fn dispatch_pending(&self) -> Result<Vec<DispatchReport>> {
        let env = self.executor.env().clone();
        let store = Arc::clone(self.executor.store());

        let max_total = env.config.dispatch.max_polecats.max(0) as usize;
        let max_per_rig = env.config.dispatch.max_per_rig.max(1) as usize;

        let mut contexts = open_contexts(store.as_ref()).await?;
        contexts.sort_by(|a, b| a.1.enqueued_at.cmp(&b.1.enqueued_at).then(a.0.cmp(&b.0)));

        let mut per_rig: BTreeMap<String, usize> = BTreeMap::new();
        let mut reports = Vec::new();

        for (ctx_id, ctx) in contexts {
            if max_total > 0 && reports.len() >= max_total {
                break;
            }
            let rig_slots = per_rig.entry(ctx.target_rig.clone()).or_insert(0);
            if *rig_slots >= max_per_rig {
                continue;
            }
            *rig_slots += 1;

            let params = SlingParams::from_context(&ctx);
            let outcome = match self.executor.execute_sling(&params).await {
                Ok(outcome) => {
                    close_context(store.as_ref(), &ctx_id).await?;
                    outcome
                }
                Err(e) => {
                    warn!(context = %ctx_id, bead = %ctx.work_bead, error = %e, "deferred dispatch failed");
                    SlingOutcome {
                        bead_id: ctx.work_bead.clone(),
                        polecat: String::new(),
                        success: false,
                        err_msg: e.to_string(),
                        attached_molecule: None,
                    }
                }
            };
            reports.push(DispatchReport {
                context_id: ctx_id,
                outcome,
            });
        }

        Ok(reports)
    }

    /// Wave reconciliation for an open convoy: when every task of the
    /// current wave is closed, dispatch the next one; when every tracked
    /// bead is closed, close the convoy.
    pub async fn reconcile_convoy(&self, convoy: &BeadId) -> Result<ReconcileReport> {
        let env = self.executor.env().clone();
        let store = Arc::clone(self.executor.store());

        let collected = collect(store.as_ref(), &env.routes, &StageInput::Convoy(convoy.clone()))
            .await
            .map_err(|e| match e {
                CollectError::Store(s) => ScheduleError::Store(s),
                other => ScheduleError::Store(StoreError::Command(other.to_string())),
            })?;
        let dag = ConvoyDag::build(&collected.beads, &collected.deps);

        // Everything closed: the convoy is done.
        if dag.nodes().all(|n| n.is_closed()) {
            store
                .update_bead(convoy, gt_store::BeadPatch::status(BeadStatus::Closed))
                .await?;
            info!(convoy = %convoy, "all tracked beads closed; convoy closed");
            return Ok(ReconcileReport {
                convoy: convoy.clone(),
                convoy_closed: true,
                dispatched: Vec::new(),
            });
        }

        let waves = match plan_waves(&dag) {
            Ok(waves) => waves,
            Err(WaveError::NoSlingable) => Vec::new(),
            Err(e) => return Err(ScheduleError::Store(StoreError::Command(e.to_string()))),
        };

        // Waves are computed over non-closed nodes, so the frontier is
        // simply Wave 1: its members' blockers have all closed.
        let mut dispatched = Vec::new();
        let delay = Duration::from_millis(env.config.dispatch.inter_spawn_delay_ms);
        if let Some(frontier) = waves.first() {
            for (n, task) in frontier.tasks.iter().enumerate() {
                let Some(node) = dag.node(task) else { continue };
                // Already running tasks stay untouched.
                if node.status != BeadStatus::Open {
                    continue;
                }
                if n > 0 {
                    tokio::time::sleep(delay).await;
                }
                let mut params = SlingParams::batch_member(task.clone(), node.rig.clone());
                params.no_convoy = true;
                params.caller = "reconcile".into();
                match self.executor.execute_sling(&params).await {
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

        Ok(ReconcileReport {
            convoy: convoy.clone(),
            convoy_closed: false,
            dispatched,
        })
    }
}

/// Result of one reconciliation pass over a convoy.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcileReport {
    pub convoy: BeadId,
    pub convoy_closed: bool,
    pub dispatched: Vec<SlingOutcome>,
}

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use gt_core::env::TownEnv;
use gt_core::events::{EventFeed, FeedEvent, FeedEventKind};
use gt_core::types::{
    AttachmentFields, BeadId, BeadStatus, MergeStrategy, SlingContext, SlingMode,
};
use gt_rig::provision::{PolecatProvisioner, ProvisionError, ProvisionedPolecat, SpawnOpts};
use gt_rig::session::{parse_polecat_address, session_name, SessionHost};
use gt_store::mail::{send_shutdown, ShutdownNotice};
use gt_store::{attach, BeadPatch, BeadStore, NewBead, StoreError, StoreScope};

use crate::convoy::new_convoy_id;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SlingError {
    #[error("bead not found: {0}")]
    NotFound(BeadId),
    #[error("{0} is {status} -- pass --force to take it over", status = .1.as_str())]
    HookedOrPinned(BeadId, BeadStatus),
    #[error("{0} is deferred; deferred beads need an explicit --force")]
    DeferredNeedsForce(BeadId),
    #[error("{0} already carries molecules ({molecules}) -- re-run with --force to burn them", molecules = .1.join(", "))]
    StaleMolecules(BeadId, Vec<String>),
    #[error("unknown rig: {0}")]
    UnknownRig(String),
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("formula cook failed: {0}")]
    CookFailed(String),
    #[error("formula instantiation failed: {0}")]
    InstantiateFailed(String),
    #[error("hooking {0} failed after {1} attempts: {2}")]
    HookFailed(BeadId, u32, String),
    #[error("dolt branch creation failed: {0}")]
    BranchCreateFailed(String),
    #[error("session start failed: {0}")]
    SessionStartFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SlingError>;

// ---------------------------------------------------------------------------
// SlingParams
// ---------------------------------------------------------------------------

/// Everything one sling needs. Constructors fix the `formula_fail_fatal`
/// default: fatal for a single sling, non-fatal for batch members -- callers
/// that care must be explicit.
#[derive(Debug, Clone)]
pub struct SlingParams {
    pub work_bead: BeadId,
    pub target_rig: String,
    pub formula: Option<String>,
    pub args: Option<String>,
    pub vars: Vec<(String, String)>,
    pub merge: Option<MergeStrategy>,
    pub base_branch: Option<String>,
    pub account: Option<String>,
    pub agent_override: Option<String>,
    pub force: bool,
    pub no_convoy: bool,
    pub owned: bool,
    pub no_merge: bool,
    pub hook_raw: bool,
    pub mode: SlingMode,
    pub skip_cook: bool,
    pub formula_fail_fatal: bool,
    /// The caller wakes rig supervisors itself (queue dispatcher).
    pub no_boot: bool,
    /// Caller context recorded in events and attachment fields.
    pub caller: String,
}

impl SlingParams {
    fn base(work_bead: BeadId, target_rig: impl Into<String>) -> Self {
        Self {
            work_bead,
            target_rig: target_rig.into(),
            formula: None,
            args: None,
            vars: Vec::new(),
            merge: None,
            base_branch: None,
            account: None,
            agent_override: None,
            force: false,
            no_convoy: false,
            owned: false,
            no_merge: false,
            hook_raw: false,
            mode: SlingMode::Normal,
            skip_cook: false,
            formula_fail_fatal: true,
            no_boot: false,
            caller: "cli".into(),
        }
    }

    /// Single-sling defaults: formula failure is fatal.
    pub fn single(work_bead: BeadId, target_rig: impl Into<String>) -> Self {
        Self::base(work_bead, target_rig)
    }

    /// Batch-member defaults: formula failure warns and continues raw.
    pub fn batch_member(work_bead: BeadId, target_rig: impl Into<String>) -> Self {
        Self {
            formula_fail_fatal: false,
            ..Self::base(work_bead, target_rig)
        }
    }

    /// Rebuild params from a persisted sling context (queue dispatch path).
    pub fn from_context(ctx: &SlingContext) -> Self {
        Self {
            work_bead: ctx.work_bead.clone(),
            target_rig: ctx.target_rig.clone(),
            formula: ctx.formula.clone(),
            args: ctx.args.clone(),
            vars: ctx.vars.clone(),
            merge: ctx.merge,
            base_branch: ctx.base_branch.clone(),
            account: ctx.account.clone(),
            agent_override: ctx.agent_override.clone(),
            force: false,
            no_convoy: true, // the context already carries its convoy link
            owned: ctx.owned,
            no_merge: ctx.no_merge,
            hook_raw: ctx.hook_raw,
            mode: ctx.mode,
            skip_cook: true, // pre-cooked at enqueue time
            formula_fail_fatal: false,
            no_boot: true,
            caller: "queue-dispatch".into(),
        }
    }
}

/// Per-bead dispatch result, as reported to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlingOutcome {
    pub bead_id: BeadId,
    pub polecat: String,
    pub success: bool,
    pub err_msg: String,
    pub attached_molecule: Option<String>,
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Undo actions registered as pipeline steps succeed and popped LIFO on
/// failure. Burned molecules are never restored.
enum Rollback {
    DestroyPolecat,
    RemoveAutoConvoy { convoy: BeadId, bead: BeadId },
    Unhook { bead: BeadId, status: BeadStatus, assignee: String },
    ClearAgentState { agent_bead: BeadId },
}

// ---------------------------------------------------------------------------
// SlingExecutor
// ---------------------------------------------------------------------------

/// Drives the 12-step pipeline that atomically transitions a bead from
/// queued to running on a freshly provisioned polecat.
pub struct SlingExecutor {
    store: Arc<dyn BeadStore>,
    provisioner: Arc<dyn PolecatProvisioner>,
    sessions: Arc<dyn SessionHost>,
    feed: EventFeed,
    env: TownEnv,
}

impl SlingExecutor {
    pub fn new(
        env: TownEnv,
        store: Arc<dyn BeadStore>,
        provisioner: Arc<dyn PolecatProvisioner>,
        sessions: Arc<dyn SessionHost>,
    ) -> Self {
        let feed = EventFeed::new(&env.town_root);
        Self {
            store,
            provisioner,
            sessions,
            feed,
            env,
        }
    }

    pub fn store(&self) -> &Arc<dyn BeadStore> {
        &self.store
    }

    pub fn env(&self) -> &TownEnv {
        &self.env
    }

    /// Execute one sling, strictly in step order. On any hard failure every
    /// previously produced artifact is rolled back in LIFO order before the
    /// error surfaces.
    pub async fn execute_sling(&self, params: &SlingParams) -> Result<SlingOutcome> {
        let explicit_force = params.force;
        let mut force = params.force;

        // Step 1: load & gate.
        let bead = match self.store.show(&params.work_bead).await {
            Ok(b) => b,
            Err(StoreError::NotFound(id)) => return Err(SlingError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let dead_hook = match parse_polecat_address(&bead.assignee) {
            Some((rig, name)) => !self.sessions.is_alive(&session_name(&rig, &name)).await,
            None => false,
        };
        let mut auto_forced = false;
        if !force && dead_hook {
            info!(bead = %bead.id, assignee = %bead.assignee, "assignee session dead; auto-forcing");
            force = true;
            auto_forced = true;
        }

        if matches!(bead.status, BeadStatus::Hooked | BeadStatus::Pinned) && !force {
            return Err(SlingError::HookedOrPinned(bead.id.clone(), bead.status.clone()));
        }
        if bead.status == BeadStatus::Deferred && !explicit_force && !auto_forced {
            return Err(SlingError::DeferredNeedsForce(bead.id.clone()));
        }

        // Step 2: preempt a live hooked polecat. Best-effort; no rollback
        // when the send fails.
        if force && bead.status == BeadStatus::Hooked && !dead_hook {
            if let Some((prior_rig, _)) = parse_polecat_address(&bead.assignee) {
                let notice = ShutdownNotice::work_reassigned(
                    params.caller.clone(),
                    bead.id.clone(),
                    format!("{}/polecats", params.target_rig),
                );
                send_shutdown(self.store.as_ref(), &prior_rig, &notice).await;
                self.feed.emit(FeedEvent::new(
                    FeedEventKind::LifecycleShutdown,
                    params.caller.clone(),
                    serde_json::json!({
                        "bead": bead.id,
                        "rig": prior_rig,
                        "reason": "work_reassigned",
                    }),
                ));
            }
        }

        // Step 3: burn stale molecules.
        if params.formula.is_some() {
            let molecules = self.store.attached_molecules(&bead.id).await?;
            if !molecules.is_empty() {
                if !force {
                    return Err(SlingError::StaleMolecules(bead.id.clone(), molecules));
                }
                for molecule in &molecules {
                    self.store.burn_molecule(molecule, &bead.id).await?;
                }
            }
        }

        let mut stack: Vec<Rollback> = Vec::new();

        // Step 4: provision the polecat.
        let rig = self
            .env
            .routes
            .rig_by_name(&params.target_rig)
            .ok_or_else(|| SlingError::UnknownRig(params.target_rig.clone()))?
            .clone();
        let opts = SpawnOpts {
            base_branch: params.base_branch.clone(),
            account: params.account.clone(),
            agent_override: params.agent_override.clone(),
            no_boot: params.no_boot,
        };
        let polecat = self.provisioner.spawn_polecat_for_sling(&rig, &opts).await?;
        stack.push(Rollback::DestroyPolecat);

        // Step 5: auto-convoy.
        if !params.no_convoy {
            match self.find_tracking_convoy(&bead.id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let convoy = new_convoy_id();
                    let mut new = NewBead::new(
                        convoy.clone(),
                        format!("Convoy: {}", bead.title),
                        gt_core::types::BeadType::Convoy,
                    );
                    new.status = BeadStatus::Open;
                    if let Err(e) = self.store.create_bead(StoreScope::Town, new).await {
                        self.unwind(stack, polecat.as_ref()).await;
                        return Err(e.into());
                    }
                    if let Err(e) = self
                        .store
                        .dep_add(&convoy, &bead.id, &gt_core::types::EdgeType::Tracks)
                        .await
                    {
                        self.unwind(stack, polecat.as_ref()).await;
                        return Err(e.into());
                    }
                    stack.push(Rollback::RemoveAutoConvoy {
                        convoy,
                        bead: bead.id.clone(),
                    });
                }
                Err(e) => {
                    self.unwind(stack, polecat.as_ref()).await;
                    return Err(e.into());
                }
            }
        }

        // Step 6: cook the formula.
        let mut cooked = false;
        if let Some(formula) = &params.formula {
            if params.skip_cook {
                cooked = true;
            } else {
                match self.store.cook_formula(formula).await {
                    Ok(()) => cooked = true,
                    Err(e) if params.formula_fail_fatal => {
                        self.unwind(stack, polecat.as_ref()).await;
                        return Err(SlingError::CookFailed(e.to_string()));
                    }
                    Err(e) => {
                        warn!(formula = %formula, error = %e, "cook failed; continuing with the raw bead");
                    }
                }
            }
        }

        // Step 7: instantiate the formula on the bead. Rig command vars,
        // then user vars, then the base-branch var; later wins.
        let mut hook_target = bead.id.clone();
        let mut attached_molecule: Option<String> = None;
        if let Some(formula) = &params.formula {
            if cooked && !params.hook_raw {
                let mut vars: Vec<(String, String)> = vec![
                    ("rig".to_string(), rig.name.clone()),
                    ("town_root".to_string(), self.env.town_root.display().to_string()),
                ];
                vars.extend(params.vars.iter().cloned());
                vars.push(("base_branch".to_string(), polecat.base_branch().to_string()));

                match self.store.instantiate_formula(&bead.id, formula, &vars).await {
                    Ok(bond) => {
                        hook_target = bond.root;
                        attached_molecule = Some(bond.molecule);
                    }
                    Err(e) if params.formula_fail_fatal => {
                        self.unwind(stack, polecat.as_ref()).await;
                        return Err(SlingError::InstantiateFailed(e.to_string()));
                    }
                    Err(e) => {
                        warn!(formula = %formula, error = %e, "instantiation failed; hooking the raw bead");
                    }
                }
            }
        }

        // Step 8: hook the bead with bounded retry.
        let agent = params
            .agent_override
            .clone()
            .unwrap_or_else(|| polecat.agent_id());
        let (prior_status, prior_assignee) = if hook_target == bead.id {
            (bead.status.clone(), bead.assignee.clone())
        } else {
            match self.store.show(&hook_target).await {
                Ok(root) => (root.status, root.assignee),
                Err(e) => {
                    self.unwind(stack, polecat.as_ref()).await;
                    return Err(e.into());
                }
            }
        };

        let attempts = self.env.config.dispatch.hook_retry_attempts.max(1);
        let mut hooked = false;
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            let patch = BeadPatch {
                status: Some(BeadStatus::Hooked),
                assignee: Some(agent.clone()),
                ..BeadPatch::default()
            };
            match self.store.update_bead(&hook_target, patch).await {
                Ok(()) => {
                    hooked = true;
                    break;
                }
                Err(e) => {
                    last_err = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                }
            }
        }
        if !hooked {
            self.unwind(stack, polecat.as_ref()).await;
            return Err(SlingError::HookFailed(hook_target, attempts, last_err));
        }
        stack.push(Rollback::Unhook {
            bead: hook_target.clone(),
            status: prior_status,
            assignee: prior_assignee,
        });

        // Step 9: emit the sling event (fire-and-forget).
        self.feed.emit(FeedEvent::new(
            FeedEventKind::Sling,
            params.caller.clone(),
            serde_json::json!({
                "bead": bead.id,
                "hooked": hook_target,
                "rig": rig.name,
                "polecat": polecat.name(),
            }),
        ));

        // Step 10: record hook_bead on the agent identity bead. Best-effort
        // cross-store write.
        let agent_bead = BeadId::new(format!("hq-agent-{}", agent.replace('/', "-")));
        let agent_patch = BeadPatch {
            description: Some(format!("hook_bead: {hook_target}")),
            ..BeadPatch::default()
        };
        match self.store.update_bead(&agent_bead, agent_patch).await {
            Ok(()) => stack.push(Rollback::ClearAgentState {
                agent_bead: agent_bead.clone(),
            }),
            Err(e) => {
                warn!(agent = %agent, error = %e, "agent state update skipped");
            }
        }

        // Step 11: persist attachment fields into the hooked bead.
        let fields = AttachmentFields {
            dispatcher: params.caller.clone(),
            args: params.args.clone().unwrap_or_default(),
            molecule: attached_molecule.clone().unwrap_or_default(),
            no_merge: params.no_merge,
            mode: params.mode,
        };
        let persisted = match self.store.show(&hook_target).await {
            Ok(current) => {
                let description = attach::upsert_attachment(&current.description, &fields);
                self.store
                    .update_bead(
                        &hook_target,
                        BeadPatch {
                            description: Some(description),
                            ..BeadPatch::default()
                        },
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.unwind(stack, polecat.as_ref()).await;
            return Err(e.into());
        }

        // Step 12: dolt branch, then session.
        if let Err(e) = polecat.create_dolt_branch().await {
            self.unwind(stack, polecat.as_ref()).await;
            return Err(SlingError::BranchCreateFailed(e.to_string()));
        }
        if let Err(e) = polecat.start_session().await {
            self.unwind(stack, polecat.as_ref()).await;
            return Err(SlingError::SessionStartFailed(e.to_string()));
        }

        info!(
            bead = %bead.id,
            polecat = %polecat.name(),
            rig = %rig.name,
            "bead slung"
        );

        Ok(SlingOutcome {
            bead_id: bead.id,
            polecat: polecat.name().to_string(),
            success: true,
            err_msg: String::new(),
            attached_molecule,
        })
    }

    /// Sequential batch sling with inter-spawn delay and an admission
    /// throttle: after every `max_concurrent` spawns the batch cools down
    /// before continuing.
    pub async fn execute_batch(
        &self,
        beads: &[BeadId],
        template: &SlingParams,
        max_concurrent: usize,
    ) -> Vec<SlingOutcome> {
        let mut outcomes = Vec::with_capacity(beads.len());
        let spawn_delay = Duration::from_millis(self.env.config.dispatch.batch_spawn_delay_ms);
        let cooldown = Duration::from_millis(self.env.config.dispatch.batch_cooldown_ms);

        for (n, bead) in beads.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(spawn_delay).await;
            }
            if max_concurrent > 0 && n > 0 && n % max_concurrent == 0 {
                tokio::time::sleep(cooldown).await;
            }

            let params = SlingParams {
                work_bead: bead.clone(),
                ..template.clone()
            };
            match self.execute_sling(&params).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(SlingOutcome {
                    bead_id: bead.clone(),
                    polecat: String::new(),
                    success: false,
                    err_msg: e.to_string(),
                    attached_molecule: None,
                }),
            }
        }
        outcomes
    }

    /// First convoy whose tracked set contains the bead, if any.
    pub async fn find_tracking_convoy(
        &self,
        bead: &BeadId,
    ) -> gt_store::Result<Option<BeadId>> {
        for convoy in self.store.list_convoys().await? {
            if convoy.status.is_terminal() {
                continue;
            }
            if self.store.tracked_beads(&convoy.id).await?.contains(bead) {
                return Ok(Some(convoy.id));
            }
        }
        Ok(None)
    }

    /// Pop the rollback stack LIFO, logging (not surfacing) undo failures.
    async fn unwind(&self, mut stack: Vec<Rollback>, polecat: &dyn ProvisionedPolecat) {
        while let Some(action) = stack.pop() {
            match action {
                Rollback::ClearAgentState { agent_bead } => {
                    let patch = BeadPatch {
                        description: Some(String::new()),
                        ..BeadPatch::default()
                    };
                    if let Err(e) = self.store.update_bead(&agent_bead, patch).await {
                        warn!(bead = %agent_bead, error = %e, "agent state rollback failed");
                    }
                }
                Rollback::Unhook { bead, status, assignee } => {
                    let patch = BeadPatch {
                        status: Some(status),
                        assignee: Some(assignee),
                        ..BeadPatch::default()
                    };
                    if let Err(e) = self.store.update_bead(&bead, patch).await {
                        warn!(bead = %bead, error = %e, "unhook rollback failed");
                    }
                }
                Rollback::RemoveAutoConvoy { convoy, bead } => {
                    if let Err(e) = self
                        .store
                        .dep_remove(&convoy, &bead, &gt_core::types::EdgeType::Tracks)
                        .await
                    {
                        warn!(convoy = %convoy, error = %e, "convoy unlink rollback failed");
                    }
                    let patch = BeadPatch::status(BeadStatus::Closed);
                    if let Err(e) = self.store.update_bead(&convoy, patch).await {
                        warn!(convoy = %convoy, error = %e, "convoy close rollback failed");
                    }
                }
                Rollback::DestroyPolecat => {
                    if let Err(e) = polecat.destroy().await {
                        warn!(polecat = %polecat.name(), error = %e, "polecat teardown failed");
                    }
                }
            }
        }
    }
}

use std::collections::BTreeMap;

use gt_core::routes::Routes;
use gt_core::types::{BeadId, RigAvailability};
use gt_rig::availability::{rig_availability, RigError};
use gt_store::BeadStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error(
        "{bead} belongs to rig {owning}, not {target}. Options: \
         (1) drop the mismatched bead from the batch, \
         (2) sling it separately to {owning}, \
         (3) re-run with --force to dispatch cross-rig"
    )]
    CrossRig {
        bead: BeadId,
        owning: String,
        target: String,
    },
    #[error("batch resolves to multiple rigs: {0}")]
    MixedTargets(String),
    #[error("no target rig given and none of the beads resolves to one")]
    NoTarget,
    #[error("unknown rig: {0}")]
    UnknownRig(String),
    #[error("rig {rig} is {}; pass --force to dispatch anyway", state.as_str())]
    BlockedRig { rig: String, state: RigAvailability },
    #[error(transparent)]
    Rig(#[from] RigError),
}

pub type Result<T> = std::result::Result<T, GuardError>;

// ---------------------------------------------------------------------------
// Cross-rig guard
// ---------------------------------------------------------------------------

/// Reject a sling whose bead belongs to a different rig than the target,
/// unless forced. Beads with unregistered prefixes pass (the validator
/// catches those at staging).
pub fn check_cross_rig(routes: &Routes, bead: &BeadId, target: &str, force: bool) -> Result<()> {
    let owning = routes.rig_name_for(bead);
    if owning.is_empty() || owning == target || force {
        return Ok(());
    }
    Err(GuardError::CrossRig {
        bead: bead.clone(),
        owning,
        target: target.to_string(),
    })
}

/// Batch variant: all beads must agree on one target rig, pairwise. With no
/// explicit target, the target is inferred from the beads themselves.
/// Returns the effective target rig.
pub fn check_batch_target(
    routes: &Routes,
    beads: &[BeadId],
    target: Option<&str>,
    force: bool,
) -> Result<String> {
    match target {
        Some(target) => {
            if !routes.is_known_rig(target) {
                return Err(GuardError::UnknownRig(target.to_string()));
            }
            for bead in beads {
                check_cross_rig(routes, bead, target, force)?;
            }
            Ok(target.to_string())
        }
        None => {
            let mut per_rig: BTreeMap<String, Vec<BeadId>> = BTreeMap::new();
            for bead in beads {
                let owning = routes.rig_name_for(bead);
                if owning.is_empty() {
                    return Err(GuardError::NoTarget);
                }
                per_rig.entry(owning).or_default().push(bead.clone());
            }
            if per_rig.is_empty() {
                return Err(GuardError::NoTarget);
            }
            if per_rig.len() > 1 && !force {
                let rendered = per_rig
                    .iter()
                    .map(|(rig, ids)| {
                        format!(
                            "{rig}: [{}]",
                            ids.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(", ")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(GuardError::MixedTargets(rendered));
            }
            // Forced mixed batches dispatch to the largest group's rig.
            Ok(per_rig
                .into_iter()
                .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(&a.0)))
                .map(|(rig, _)| rig)
                .unwrap_or_default())
        }
    }
}

// ---------------------------------------------------------------------------
// Rig-availability guard
// ---------------------------------------------------------------------------

/// Reject dispatch onto a parked or docked rig unless forced.
pub async fn check_rig_available(
    store: &dyn BeadStore,
    routes: &Routes,
    rig_name: &str,
    force: bool,
) -> Result<()> {
    let rig = routes
        .rig_by_name(rig_name)
        .ok_or_else(|| GuardError::UnknownRig(rig_name.to_string()))?;
    let state = rig_availability(store, rig).await?;
    if state.is_blocked() && !force {
        return Err(GuardError::BlockedRig {
            rig: rig_name.to_string(),
            state,
        });
    }
    Ok(())
}

/// Availability of every rig named by the set, for validator warnings and
/// launch aggregation. Unknown rig names are skipped.
pub async fn availability_map(
    store: &dyn BeadStore,
    routes: &Routes,
    rig_names: impl IntoIterator<Item = String>,
) -> Result<BTreeMap<String, RigAvailability>> {
    let mut map = BTreeMap::new();
    for name in rig_names {
        if name.is_empty() {
            continue;
        }
        let Some(rig) = routes.rig_by_name(&name) else {
            continue;
        };
        let state = rig_availability(store, rig).await?;
        map.insert(name, state);
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;

use gt_core::types::{BeadId, Wave};

use crate::dag::ConvoyDag;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WaveError {
    #[error("no slingable tasks in the staged set")]
    NoSlingable,
    #[error("dependency cycle among: {}", .0.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(", "))]
    CycleDetected(Vec<BeadId>),
}

pub type Result<T> = std::result::Result<T, WaveError>;

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Partition the DAG into waves: Kahn's algorithm over all non-closed
/// nodes, with the output filtered to slingable beads.
///
/// Gates (epics, decisions) participate in the ordering -- a task blocked
/// by an open decision stays behind it -- but never occupy a wave slot.
/// Closed nodes are removed up front; they have already executed.
pub fn plan_waves(dag: &ConvoyDag) -> Result<Vec<Wave>> {
    // Working set: every non-closed node.
    let live: BTreeMap<BeadId, &crate::dag::DagNode> = dag
        .nodes()
        .filter(|n| !n.is_closed())
        .map(|n| (n.id.clone(), n))
        .collect();

    if !live.values().any(|n| n.is_slingable()) {
        return Err(WaveError::NoSlingable);
    }

    // In-degree counts only execution blockers that are themselves live.
    let mut in_degree: BTreeMap<BeadId, usize> = BTreeMap::new();
    for (id, node) in &live {
        let mut blockers: Vec<&BeadId> = node
            .blocked_by
            .iter()
            .filter(|b| live.contains_key(*b))
            .collect();
        blockers.sort();
        blockers.dedup();
        in_degree.insert(id.clone(), blockers.len());
    }

    let mut waves: Vec<Wave> = Vec::new();
    let mut remaining = live.len();

    while remaining > 0 {
        // All currently unblocked nodes, ascending by id.
        let ready: Vec<BeadId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| id.clone())
            .collect();

        if ready.is_empty() {
            let stuck: Vec<BeadId> = in_degree.keys().cloned().collect();
            return Err(WaveError::CycleDetected(stuck));
        }

        let slingable: Vec<BeadId> = ready
            .iter()
            .filter(|id| live[*id].is_slingable())
            .cloned()
            .collect();
        if !slingable.is_empty() {
            waves.push(Wave {
                number: waves.len() + 1,
                tasks: slingable,
            });
        }

        for id in &ready {
            in_degree.remove(id);
            remaining -= 1;
            let mut successors = live[id].blocks.clone();
            successors.sort();
            for succ in successors {
                if let Some(deg) = in_degree.get_mut(&succ) {
                    *deg = deg.saturating_sub(1);
                }
            }
        }
    }

    Ok(waves)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

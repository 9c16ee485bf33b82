use std::collections::BTreeMap;

use gt_core::types::{BeadId, Finding, RigAvailability, Severity, StageStatus, Wave};

use crate::dag::ConvoyDag;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Outcome of the error and warning passes over a staged DAG.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

impl Validation {
    /// Error -> no convoy; warnings -> staged_warnings; clean -> staged_ready.
    pub fn stage_status(&self) -> StageStatus {
        if !self.errors.is_empty() {
            StageStatus::Error
        } else if !self.warnings.is_empty() {
            StageStatus::StagedWarnings
        } else {
            StageStatus::StagedReady
        }
    }
}

fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by_key(|f| f.sort_key());
}

/// Run the fatal checks. Any finding here blocks convoy creation.
pub fn error_checks(dag: &ConvoyDag) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Some(cycle) = find_cycle(dag) {
        findings.push(Finding {
            severity: Severity::Error,
            category: "cycle".into(),
            message: format!(
                "dependency cycle: {}",
                cycle
                    .iter()
                    .map(|i| i.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            ),
            suggested_fix: "remove one of the blocking edges to break the cycle".into(),
            bead_ids: cycle,
        });
    }

    for id in dag.slingable_ids() {
        let node = dag.node(&id).expect("slingable id from dag");
        if node.rig.is_empty() {
            findings.push(Finding {
                severity: Severity::Error,
                category: "no-rig".into(),
                bead_ids: vec![id.clone()],
                message: format!("{id} has no resolvable rig (unregistered prefix)"),
                suggested_fix: "register the id prefix in the routes file".into(),
            });
        }
    }

    sort_findings(&mut findings);
    findings
}

/// Run the advisory checks. The staged convoy carries these as
/// `staged_warnings`.
pub fn warning_checks(
    dag: &ConvoyDag,
    epic_input: bool,
    waves: &[Wave],
    availability: &BTreeMap<String, RigAvailability>,
    wave_capacity: usize,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    findings.extend(orphan_check(dag, epic_input));
    findings.extend(blocked_rig_check(dag, availability));
    findings.extend(cross_rig_check(dag));
    findings.extend(capacity_check(waves, wave_capacity));
    findings.extend(missing_branch_check(dag));
    sort_findings(&mut findings);
    findings
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Tri-color DFS over execution edges in sorted node and neighbor order.
///
/// On a gray-gray edge the cycle is reconstructed by walking the parent
/// chain back to the target and reversing, with the closing endpoint once
/// at the head.
fn find_cycle(dag: &ConvoyDag) -> Option<Vec<BeadId>> {
    let mut color: BTreeMap<BeadId, Color> =
        dag.ids().into_iter().map(|id| (id, Color::White)).collect();
    let mut parent: BTreeMap<BeadId, BeadId> = BTreeMap::new();

    for start in dag.ids() {
        if color[&start] != Color::White {
            continue;
        }
        if let Some(cycle) = dfs(dag, &start, &mut color, &mut parent) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    dag: &ConvoyDag,
    node: &BeadId,
    color: &mut BTreeMap<BeadId, Color>,
    parent: &mut BTreeMap<BeadId, BeadId>,
) -> Option<Vec<BeadId>> {
    color.insert(node.clone(), Color::Gray);

    let mut neighbors = dag.node(node).map(|n| n.blocked_by.clone()).unwrap_or_default();
    neighbors.sort();

    for next in neighbors {
        match color.get(&next) {
            Some(Color::White) => {
                parent.insert(next.clone(), node.clone());
                if let Some(cycle) = dfs(dag, &next, color, parent) {
                    return Some(cycle);
                }
            }
            Some(Color::Gray) => {
                // Closing edge node -> next; walk back from node to next.
                let mut cycle = vec![node.clone()];
                let mut cur = node.clone();
                while cur != next {
                    cur = parent.get(&cur).cloned()?;
                    cycle.push(cur.clone());
                }
                cycle.reverse();
                return Some(cycle);
            }
            _ => {}
        }
    }

    color.insert(node.clone(), Color::Black);
    None
}

// ---------------------------------------------------------------------------
// Warning passes
// ---------------------------------------------------------------------------

/// Epic input only: a slingable node with no execution edges to or from any
/// other slingable node.
fn orphan_check(dag: &ConvoyDag, epic_input: bool) -> Vec<Finding> {
    if !epic_input {
        return Vec::new();
    }
    let slingable = dag.slingable_ids();
    let mut findings = Vec::new();
    for id in &slingable {
        let node = dag.node(id).expect("id from dag");
        let connected = node
            .blocked_by
            .iter()
            .chain(node.blocks.iter())
            .any(|other| slingable.contains(other));
        if !connected {
            findings.push(Finding {
                severity: Severity::Warning,
                category: "orphan".into(),
                bead_ids: vec![id.clone()],
                message: format!("{id} has no dependency relationship with any other task"),
                suggested_fix: "link it into the plan or stage it separately".into(),
            });
        }
    }
    findings
}

/// One consolidated finding per parked or docked rig.
fn blocked_rig_check(
    dag: &ConvoyDag,
    availability: &BTreeMap<String, RigAvailability>,
) -> Vec<Finding> {
    let mut per_rig: BTreeMap<&str, Vec<BeadId>> = BTreeMap::new();
    for id in dag.slingable_ids() {
        let node = dag.node(&id).expect("id from dag");
        if let Some(avail) = availability.get(&node.rig) {
            if avail.is_blocked() {
                per_rig.entry(node.rig.as_str()).or_default().push(id);
            }
        }
    }
    per_rig
        .into_iter()
        .map(|(rig, mut ids)| {
            ids.sort();
            let state = availability
                .get(rig)
                .map(|a| a.as_str())
                .unwrap_or("blocked");
            Finding {
                severity: Severity::Warning,
                category: "blocked-rig".into(),
                message: format!("rig {rig} is {state}; its tasks cannot be dispatched"),
                suggested_fix: format!("unpark rig {rig} before launch, or launch with force"),
                bead_ids: ids,
            }
        })
        .collect()
}

/// One finding per slingable node outside the primary rig. Primary is the
/// rig with the most slingable nodes, ties broken alphabetically.
fn cross_rig_check(dag: &ConvoyDag) -> Vec<Finding> {
    let counts = dag.rig_counts();
    if counts.len() < 2 {
        return Vec::new();
    }
    let primary = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(rig, _)| rig.clone())
        .unwrap_or_default();

    let mut findings = Vec::new();
    for id in dag.slingable_ids() {
        let node = dag.node(&id).expect("id from dag");
        if node.rig != primary {
            findings.push(Finding {
                severity: Severity::Warning,
                category: "cross-rig".into(),
                bead_ids: vec![id.clone()],
                message: format!(
                    "{id} lives on rig {} while the convoy is primarily on {primary}",
                    node.rig
                ),
                suggested_fix: "split the convoy per rig, or accept cross-rig dispatch".into(),
            });
        }
    }
    findings
}

fn capacity_check(waves: &[Wave], wave_capacity: usize) -> Vec<Finding> {
    waves
        .iter()
        .filter(|w| w.tasks.len() > wave_capacity)
        .map(|w| Finding {
            severity: Severity::Warning,
            category: "capacity".into(),
            bead_ids: w.tasks.clone(),
            message: format!(
                "wave {} carries {} tasks (over the {wave_capacity}-task comfort line)",
                w.number,
                w.tasks.len()
            ),
            suggested_fix: "add ordering edges to spread the wave out".into(),
        })
        .collect()
}

/// A sub-epic (non-empty parent and children) needs integration-branch
/// metadata, carried as a `branch:` label.
fn missing_branch_check(dag: &ConvoyDag) -> Vec<Finding> {
    let mut findings = Vec::new();
    for node in dag.nodes() {
        if node.bead_type != gt_core::types::BeadType::Epic {
            continue;
        }
        if node.parent.is_none() || node.children.is_empty() {
            continue;
        }
        let has_branch = node.labels.iter().any(|l| l.starts_with("branch:"));
        if !has_branch {
            findings.push(Finding {
                severity: Severity::Warning,
                category: "missing-branch".into(),
                bead_ids: vec![node.id.clone()],
                message: format!("sub-epic {} has no integration branch", node.id),
                suggested_fix: "label the epic with branch:<name>".into(),
            });
        }
    }
    findings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

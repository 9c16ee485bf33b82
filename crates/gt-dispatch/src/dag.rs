use std::collections::BTreeMap;

use gt_core::types::{Bead, BeadId, BeadStatus, BeadType, DepEdge, EdgeClass};

// ---------------------------------------------------------------------------
// DagNode
// ---------------------------------------------------------------------------

/// One bead in the analyzed set, with its adjacency split into execution
/// and hierarchy lists. The two edge sets are disjoint by construction.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub id: BeadId,
    pub title: String,
    pub bead_type: BeadType,
    pub status: BeadStatus,
    pub rig: String,
    pub labels: Vec<String>,
    /// Execution-edge blockers of this node.
    pub blocked_by: Vec<BeadId>,
    /// Nodes this one blocks (reverse execution edges).
    pub blocks: Vec<BeadId>,
    pub children: Vec<BeadId>,
    pub parent: Option<BeadId>,
}

impl DagNode {
    pub fn is_slingable(&self) -> bool {
        self.bead_type.is_slingable()
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// ConvoyDag
// ---------------------------------------------------------------------------

/// The dependency DAG over a collected bead set.
///
/// Adjacency lists are materialized verbatim in insertion order; every
/// consumer that iterates them sorts first, so the structure is
/// deterministic under any edge order.
#[derive(Debug, Clone, Default)]
pub struct ConvoyDag {
    nodes: BTreeMap<BeadId, DagNode>,
}

impl ConvoyDag {
    /// Build from the collected beads and raw edges. Edges referencing
    /// beads outside the collected set are dropped silently.
    pub fn build(beads: &[Bead], deps: &[DepEdge]) -> Self {
        let mut nodes: BTreeMap<BeadId, DagNode> = beads
            .iter()
            .map(|b| {
                (
                    b.id.clone(),
                    DagNode {
                        id: b.id.clone(),
                        title: b.title.clone(),
                        bead_type: b.bead_type.clone(),
                        status: b.status.clone(),
                        rig: b.rig.clone(),
                        labels: b.labels.clone(),
                        blocked_by: Vec::new(),
                        blocks: Vec::new(),
                        children: Vec::new(),
                        parent: None,
                    },
                )
            })
            .collect();

        for edge in deps {
            if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
                continue;
            }
            match edge.edge_type.class() {
                EdgeClass::Execution => {
                    let from = edge.from.clone();
                    let to = edge.to.clone();
                    if let Some(node) = nodes.get_mut(&from) {
                        if !node.blocked_by.contains(&to) {
                            node.blocked_by.push(to.clone());
                        }
                    }
                    if let Some(node) = nodes.get_mut(&to) {
                        if !node.blocks.contains(&from) {
                            node.blocks.push(from);
                        }
                    }
                }
                EdgeClass::Hierarchy => {
                    let child = edge.from.clone();
                    let parent = edge.to.clone();
                    if let Some(node) = nodes.get_mut(&child) {
                        node.parent = Some(parent.clone());
                    }
                    if let Some(node) = nodes.get_mut(&parent) {
                        if !node.children.contains(&child) {
                            node.children.push(child);
                        }
                    }
                }
                EdgeClass::Membership | EdgeClass::Ignored => {}
            }
        }

        Self { nodes }
    }

    pub fn node(&self, id: &BeadId) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids, ascending.
    pub fn ids(&self) -> Vec<BeadId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.values()
    }

    /// Slingable node ids, ascending.
    pub fn slingable_ids(&self) -> Vec<BeadId> {
        self.nodes
            .values()
            .filter(|n| n.is_slingable())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Distinct rigs of slingable nodes, with slingable counts.
    pub fn rig_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in self.nodes.values().filter(|n| n.is_slingable()) {
            *counts.entry(node.rig.clone()).or_insert(0) += 1;
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gt_core::types::EdgeType;

    fn bead(id: &str, bead_type: BeadType) -> Bead {
        Bead {
            id: BeadId::from(id),
            title: id.to_string(),
            bead_type,
            status: BeadStatus::Open,
            assignee: String::new(),
            labels: Vec::new(),
            description: String::new(),
            rig: "gastown".into(),
        }
    }

    fn edge(from: &str, to: &str, edge_type: EdgeType) -> DepEdge {
        DepEdge {
            from: BeadId::from(from),
            to: BeadId::from(to),
            edge_type,
        }
    }

    #[test]
    fn edges_outside_the_set_are_dropped() {
        let beads = vec![bead("gt-a0001", BeadType::Task)];
        let deps = vec![edge("gt-a0001", "gt-zzzzz", EdgeType::Blocks)];
        let dag = ConvoyDag::build(&beads, &deps);
        assert!(dag.node(&BeadId::from("gt-a0001")).expect("node").blocked_by.is_empty());
    }

    #[test]
    fn execution_and_hierarchy_lists_stay_disjoint() {
        let beads = vec![
            bead("gt-a0001", BeadType::Epic),
            bead("gt-b0001", BeadType::Task),
            bead("gt-c0001", BeadType::Task),
        ];
        let deps = vec![
            edge("gt-b0001", "gt-a0001", EdgeType::ParentChild),
            edge("gt-c0001", "gt-b0001", EdgeType::Blocks),
        ];
        let dag = ConvoyDag::build(&beads, &deps);

        let epic = dag.node(&BeadId::from("gt-a0001")).expect("epic");
        assert_eq!(epic.children, vec![BeadId::from("gt-b0001")]);
        assert!(epic.blocks.is_empty());

        let b = dag.node(&BeadId::from("gt-b0001")).expect("b");
        assert_eq!(b.parent, Some(BeadId::from("gt-a0001")));
        assert_eq!(b.blocks, vec![BeadId::from("gt-c0001")]);
        assert!(b.blocked_by.is_empty());

        let c = dag.node(&BeadId::from("gt-c0001")).expect("c");
        assert_eq!(c.blocked_by, vec![BeadId::from("gt-b0001")]);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let beads = vec![bead("gt-a0001", BeadType::Task), bead("gt-b0001", BeadType::Task)];
        let deps = vec![
            edge("gt-a0001", "gt-b0001", EdgeType::Blocks),
            edge("gt-a0001", "gt-b0001", EdgeType::WaitsFor),
        ];
        let dag = ConvoyDag::build(&beads, &deps);
        assert_eq!(
            dag.node(&BeadId::from("gt-a0001")).expect("a").blocked_by,
            vec![BeadId::from("gt-b0001")]
        );
    }

    #[test]
    fn ignored_edge_types_do_not_materialize() {
        let beads = vec![bead("gt-a0001", BeadType::Task), bead("gt-b0001", BeadType::Task)];
        let deps = vec![edge("gt-a0001", "gt-b0001", EdgeType::parse("related-to"))];
        let dag = ConvoyDag::build(&beads, &deps);
        let a = dag.node(&BeadId::from("gt-a0001")).expect("a");
        assert!(a.blocked_by.is_empty() && a.parent.is_none());
    }

    #[test]
    fn rig_counts_cover_only_slingables() {
        let mut beads = vec![
            bead("gt-a0001", BeadType::Task),
            bead("gt-b0001", BeadType::Epic),
            bead("bx-a0001", BeadType::Bug),
        ];
        beads[2].rig = "boxcar".into();
        let dag = ConvoyDag::build(&beads, &[]);
        let counts = dag.rig_counts();
        assert_eq!(counts.get("gastown"), Some(&1));
        assert_eq!(counts.get("boxcar"), Some(&1));
    }
}

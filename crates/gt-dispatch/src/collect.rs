use std::collections::{BTreeMap, BTreeSet, VecDeque};

use gt_core::routes::Routes;
use gt_core::types::{Bead, BeadId, BeadType, DepEdge};
use gt_store::{BeadStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("bead not found: {0}")]
    UnresolvedBead(BeadId),
    #[error("invalid bead id: {0}")]
    FlagLike(BeadId),
    #[error("mixed input kinds: {0}")]
    MixedInput(String),
    #[error("only one epic may be staged at a time: {}", ids_csv(.0))]
    MultipleEpics(Vec<BeadId>),
    #[error("only one convoy may be staged at a time: {}", ids_csv(.0))]
    MultipleConvoys(Vec<BeadId>),
    #[error("convoy {0} tracks no beads")]
    EmptyConvoy(BeadId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, CollectError>;

fn ids_csv(ids: &[BeadId]) -> String {
    ids.iter()
        .map(|i| i.as_str().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// StageInput
// ---------------------------------------------------------------------------

/// What the user handed to `stage`: a single epic, an explicit task list,
/// or an existing convoy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    Epic(BeadId),
    Tasks(Vec<BeadId>),
    Convoy(BeadId),
}

impl StageInput {
    pub fn is_epic(&self) -> bool {
        matches!(self, StageInput::Epic(_))
    }
}

/// Classify a raw id list into a stage input.
///
/// Inputs must be non-flag-like; at most one epic or convoy; kinds may not
/// be mixed. The mixed-input message lists each kind with its ids, both
/// alphabetically sorted, so repeated runs produce the same text.
pub async fn classify_input(store: &dyn BeadStore, ids: &[BeadId]) -> Result<StageInput> {
    for id in ids {
        if id.is_flag_like() {
            return Err(CollectError::FlagLike(id.clone()));
        }
    }

    let mut epics: Vec<BeadId> = Vec::new();
    let mut convoys: Vec<BeadId> = Vec::new();
    let mut rest: Vec<BeadId> = Vec::new();

    for id in ids {
        let bead = match store.show(id).await {
            Ok(b) => b,
            Err(StoreError::NotFound(id)) => return Err(CollectError::UnresolvedBead(id)),
            Err(e) => return Err(e.into()),
        };
        match bead.bead_type {
            BeadType::Epic => epics.push(bead.id),
            BeadType::Convoy => convoys.push(bead.id),
            _ => rest.push(bead.id),
        }
    }

    epics.sort();
    convoys.sort();
    rest.sort();

    if epics.len() > 1 {
        return Err(CollectError::MultipleEpics(epics));
    }
    if convoys.len() > 1 {
        return Err(CollectError::MultipleConvoys(convoys));
    }

    let kinds_present =
        usize::from(!epics.is_empty()) + usize::from(!convoys.is_empty()) + usize::from(!rest.is_empty());
    if kinds_present > 1 {
        let mut parts: BTreeMap<&str, &[BeadId]> = BTreeMap::new();
        if !convoys.is_empty() {
            parts.insert("convoy", &convoys);
        }
        if !epics.is_empty() {
            parts.insert("epic", &epics);
        }
        if !rest.is_empty() {
            parts.insert("task", &rest);
        }
        let rendered = parts
            .iter()
            .map(|(kind, ids)| format!("{kind}: [{}]", ids_csv(ids)))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(CollectError::MixedInput(rendered));
    }

    if let Some(epic) = epics.into_iter().next() {
        return Ok(StageInput::Epic(epic));
    }
    if let Some(convoy) = convoys.into_iter().next() {
        return Ok(StageInput::Convoy(convoy));
    }
    Ok(StageInput::Tasks(rest))
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// The bead set to analyze plus every outgoing dependency edge of its
/// members. Edges leading outside the set are dropped later by the DAG
/// builder.
#[derive(Debug, Clone)]
pub struct Collected {
    pub beads: Vec<Bead>,
    pub deps: Vec<DepEdge>,
}

/// Gather the bead set for a stage input.
pub async fn collect(
    store: &dyn BeadStore,
    routes: &Routes,
    input: &StageInput,
) -> Result<Collected> {
    match input {
        StageInput::Epic(id) => collect_epic(store, routes, id).await,
        StageInput::Tasks(ids) => collect_tasks(store, routes, ids).await,
        StageInput::Convoy(id) => collect_convoy(store, routes, id).await,
    }
}

/// BFS over parent-child edges from the epic, visiting each descendant at
/// most once, gathering every descendant plus its outgoing deps.
async fn collect_epic(store: &dyn BeadStore, routes: &Routes, epic: &BeadId) -> Result<Collected> {
    let mut beads = Vec::new();
    let mut deps = Vec::new();
    let mut visited: BTreeSet<BeadId> = BTreeSet::new();
    let mut queue: VecDeque<BeadId> = VecDeque::new();

    visited.insert(epic.clone());
    queue.push_back(epic.clone());

    while let Some(id) = queue.pop_front() {
        let bead = fetch(store, routes, &id).await?;
        deps.extend(store.deps_out(&id).await?);
        beads.push(bead);

        for child in store.children(&id).await? {
            if visited.insert(child.id.clone()) {
                queue.push_back(child.id);
            }
        }
    }

    Ok(Collected { beads, deps })
}

/// Fetch each listed bead and its outgoing deps; no traversal.
async fn collect_tasks(
    store: &dyn BeadStore,
    routes: &Routes,
    ids: &[BeadId],
) -> Result<Collected> {
    let mut beads = Vec::new();
    let mut deps = Vec::new();
    let mut seen: BTreeSet<BeadId> = BTreeSet::new();

    for id in ids {
        if !seen.insert(id.clone()) {
            continue;
        }
        beads.push(fetch(store, routes, id).await?);
        deps.extend(store.deps_out(id).await?);
    }

    Ok(Collected { beads, deps })
}

/// Read the convoy's tracks edges and recurse into task-list collection.
async fn collect_convoy(
    store: &dyn BeadStore,
    routes: &Routes,
    convoy: &BeadId,
) -> Result<Collected> {
    if !store.exists(convoy).await? {
        return Err(CollectError::UnresolvedBead(convoy.clone()));
    }
    let tracked = store.tracked_beads(convoy).await?;
    if tracked.is_empty() {
        return Err(CollectError::EmptyConvoy(convoy.clone()));
    }
    collect_tasks(store, routes, &tracked).await
}

async fn fetch(store: &dyn BeadStore, routes: &Routes, id: &BeadId) -> Result<Bead> {
    let mut bead = match store.show(id).await {
        Ok(b) => b,
        Err(StoreError::NotFound(id)) => return Err(CollectError::UnresolvedBead(id)),
        Err(e) => return Err(e.into()),
    };
    // The prefix map is authoritative for the owning rig, whatever the
    // store reported.
    bead.rig = routes.rig_name_for(&bead.id);
    Ok(bead)
}

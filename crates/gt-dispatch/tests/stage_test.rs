//! Staging end-to-end: collection, validation, overlap handling, and
//! re-stage idempotence against the in-memory store.

mod common;

use std::sync::Arc;

use gt_core::types::{BeadId, BeadStatus, BeadType, EdgeType, StageStatus};
use gt_dispatch::collect::{classify_input, CollectError};
use gt_dispatch::stage::{StageOpts, Stager};
use gt_store::memory::MemStore;
use gt_store::BeadStore;

use common::test_env;

fn fixture() -> (tempfile::TempDir, Stager, Arc<MemStore>) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let env = test_env(tmp.path());
    let store = Arc::new(MemStore::new());
    let store_dyn: Arc<dyn BeadStore> = Arc::clone(&store) as Arc<dyn BeadStore>;
    let stager = Stager::new(env, store_dyn);
    (tmp, stager, store)
}

fn ids(raw: &[&str]) -> Vec<BeadId> {
    raw.iter().map(|s| BeadId::from(*s)).collect()
}

// ---------------------------------------------------------------------------
// Cycle detection (scenario: a -> b -> c -> a)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cycle_blocks_staging_and_creates_no_convoy() {
    let (_tmp, stager, store) = fixture();
    for id in ["gt-aaa01", "gt-bbb01", "gt-ccc01"] {
        store.put_simple(id, BeadType::Task, BeadStatus::Open, "gastown");
    }
    store.link("gt-aaa01", "gt-bbb01", EdgeType::Blocks);
    store.link("gt-bbb01", "gt-ccc01", EdgeType::Blocks);
    store.link("gt-ccc01", "gt-aaa01", EdgeType::Blocks);

    let result = stager
        .stage(&ids(&["gt-aaa01", "gt-bbb01", "gt-ccc01"]), &StageOpts::default())
        .await
        .expect("stage runs");

    assert_eq!(result.status, StageStatus::Error);
    assert!(result.convoy_id.is_none());
    assert_eq!(result.errors.len(), 1);

    let finding = &result.errors[0];
    assert_eq!(finding.category, "cycle");
    assert!(finding.message.contains("dependency cycle"));
    let mut members: Vec<&str> = finding.bead_ids.iter().map(|i| i.as_str()).collect();
    members.sort();
    assert_eq!(members, vec!["gt-aaa01", "gt-bbb01", "gt-ccc01"]);

    assert!(store.list_convoys().await.expect("list").is_empty());
}

// ---------------------------------------------------------------------------
// Gate ordering (scenario: decision holds a task back)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_decision_gates_the_second_task() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");
    store.put_simple("gt-ddd01", BeadType::Decision, BeadStatus::Open, "gastown");
    store.link("gt-ttt02", "gt-ddd01", EdgeType::Blocks);

    let input = ids(&["gt-ttt01", "gt-ttt02", "gt-ddd01"]);
    let result = stager.stage(&input, &StageOpts::default()).await.expect("stage");

    assert_eq!(result.waves.len(), 2);
    assert_eq!(result.waves[0].tasks, ids(&["gt-ttt01"]));
    assert_eq!(result.waves[1].tasks, ids(&["gt-ttt02"]));

    // Close the decision and re-stage the same input: one wave now.
    store
        .update_bead(
            &BeadId::from("gt-ddd01"),
            gt_store::BeadPatch::status(BeadStatus::Closed),
        )
        .await
        .expect("close decision");

    let again = stager.stage(&input, &StageOpts::default()).await.expect("re-stage");
    assert!(again.restaged, "second stage should reuse the convoy");
    assert_eq!(again.convoy_id, result.convoy_id);
    assert_eq!(again.waves.len(), 1);
    assert_eq!(again.waves[0].tasks, ids(&["gt-ttt01", "gt-ttt02"]));
}

// ---------------------------------------------------------------------------
// Overlap handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_staged_overlap_restages_in_place() {
    let (_tmp, stager, store) = fixture();
    // Existing staged convoy tracking t1, t2.
    store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::StagedReady, "");
    for id in ["gt-ttt01", "gt-ttt02", "gt-ttt03"] {
        store.put_simple(id, BeadType::Task, BeadStatus::Open, "gastown");
    }
    store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);
    store.link("hq-cv-alpha", "gt-ttt02", EdgeType::Tracks);

    // Epic whose children are t1..t3.
    store.put_simple("gt-epi01", BeadType::Epic, BeadStatus::Open, "gastown");
    for id in ["gt-ttt01", "gt-ttt02", "gt-ttt03"] {
        store.link(id, "gt-epi01", EdgeType::ParentChild);
    }

    let result = stager
        .stage(&ids(&["gt-epi01"]), &StageOpts::default())
        .await
        .expect("stage");

    assert!(result.restaged);
    assert_eq!(result.convoy_id, Some(BeadId::from("hq-cv-alpha")));

    let mut tracked = store
        .tracked_beads(&BeadId::from("hq-cv-alpha"))
        .await
        .expect("tracked");
    tracked.sort();
    assert_eq!(tracked, ids(&["gt-ttt01", "gt-ttt02", "gt-ttt03"]));
}

#[tokio::test]
async fn restage_drops_stale_tracked_beads() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::StagedReady, "");
    for id in ["gt-ttt01", "gt-ttt02", "gt-ttt03"] {
        store.put_simple(id, BeadType::Task, BeadStatus::Open, "gastown");
    }
    store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);
    store.link("hq-cv-alpha", "gt-ttt03", EdgeType::Tracks);

    // Stage the convoy down to {t1, t2}: t3 must be unlinked.
    store.link("hq-cv-alpha", "gt-ttt02", EdgeType::Tracks);
    let tracked_before = store
        .tracked_beads(&BeadId::from("hq-cv-alpha"))
        .await
        .expect("tracked");
    assert_eq!(tracked_before.len(), 3);

    // Re-stage via task-list overlap with only t1 and t2.
    let result = stager
        .stage(&ids(&["gt-ttt01", "gt-ttt02"]), &StageOpts::default())
        .await
        .expect("stage");
    assert!(result.restaged);

    let mut tracked = store
        .tracked_beads(&BeadId::from("hq-cv-alpha"))
        .await
        .expect("tracked");
    tracked.sort();
    assert_eq!(tracked, ids(&["gt-ttt01", "gt-ttt02"]));
}

#[tokio::test]
async fn open_convoy_overlap_is_fatal() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::Open, "");
    store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);

    let err = stager
        .stage(&ids(&["gt-ttt01"]), &StageOpts::default())
        .await
        .expect_err("open overlap");
    assert!(err.to_string().contains("close it first"));
}

#[tokio::test]
async fn two_staged_overlaps_are_ambiguous() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::StagedReady, "");
    store.put_simple("hq-cv-bravo", BeadType::Convoy, BeadStatus::StagedWarnings, "");
    store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");
    store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);
    store.link("hq-cv-bravo", "gt-ttt02", EdgeType::Tracks);

    let err = stager
        .stage(&ids(&["gt-ttt01", "gt-ttt02"]), &StageOpts::default())
        .await
        .expect_err("ambiguous");
    assert!(err.to_string().contains("overlap multiple convoys"));
}

// ---------------------------------------------------------------------------
// Idempotent staging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn staging_twice_reuses_the_convoy_and_waves() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("gt-epi01", BeadType::Epic, BeadStatus::Open, "gastown");
    store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");
    store.link("gt-ttt01", "gt-epi01", EdgeType::ParentChild);
    store.link("gt-ttt02", "gt-epi01", EdgeType::ParentChild);
    store.link("gt-ttt02", "gt-ttt01", EdgeType::Blocks);

    let first = stager
        .stage(&ids(&["gt-epi01"]), &StageOpts::default())
        .await
        .expect("first");
    assert!(!first.restaged);

    let second = stager
        .stage(&ids(&["gt-epi01"]), &StageOpts::default())
        .await
        .expect("second");
    assert!(second.restaged);
    assert_eq!(second.convoy_id, first.convoy_id);
    assert_eq!(second.waves, first.waves);

    let tracked_first: std::collections::BTreeSet<BeadId> = store
        .tracked_beads(first.convoy_id.as_ref().expect("convoy"))
        .await
        .expect("tracked")
        .into_iter()
        .collect();
    assert_eq!(tracked_first.len(), 2);
}

// ---------------------------------------------------------------------------
// Input classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mixed_input_message_is_deterministic() {
    let (_tmp, _stager, store) = fixture();
    store.put_simple("gt-epi01", BeadType::Epic, BeadStatus::Open, "gastown");
    store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");
    store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");

    // Ids arrive shuffled; the message sorts kinds and ids.
    let err = classify_input(
        store.as_ref(),
        &ids(&["gt-ttt02", "gt-epi01", "gt-ttt01"]),
    )
    .await
    .expect_err("mixed");

    let text = err.to_string();
    assert_eq!(
        text,
        "mixed input kinds: epic: [gt-epi01]; task: [gt-ttt01, gt-ttt02]"
    );
}

#[tokio::test]
async fn multiple_epics_rejected() {
    let (_tmp, _stager, store) = fixture();
    store.put_simple("gt-epi01", BeadType::Epic, BeadStatus::Open, "gastown");
    store.put_simple("gt-epi02", BeadType::Epic, BeadStatus::Open, "gastown");

    let err = classify_input(store.as_ref(), &ids(&["gt-epi02", "gt-epi01"]))
        .await
        .expect_err("two epics");
    assert!(matches!(err, CollectError::MultipleEpics(_)));
}

#[tokio::test]
async fn empty_convoy_rejected() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("hq-cv-empty", BeadType::Convoy, BeadStatus::StagedReady, "");

    let err = stager
        .stage(&ids(&["hq-cv-empty"]), &StageOpts::default())
        .await
        .expect_err("empty convoy");
    assert!(err.to_string().contains("tracks no beads"));
}

#[tokio::test]
async fn unknown_prefix_yields_no_rig_error() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("zz-ttt01", BeadType::Task, BeadStatus::Open, "");

    let result = stager
        .stage(&ids(&["zz-ttt01"]), &StageOpts::default())
        .await
        .expect("stage");
    assert_eq!(result.status, StageStatus::Error);
    assert_eq!(result.errors[0].category, "no-rig");
    assert!(result.convoy_id.is_none());
}

// ---------------------------------------------------------------------------
// Warnings stage with staged_warnings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cross_rig_set_stages_with_warnings() {
    let (_tmp, stager, store) = fixture();
    store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    store.put_simple("bx-ttt01", BeadType::Task, BeadStatus::Open, "boxcar");
    store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");

    let result = stager
        .stage(&ids(&["gt-ttt01", "gt-ttt02", "bx-ttt01"]), &StageOpts::default())
        .await
        .expect("stage");

    assert_eq!(result.status, StageStatus::StagedWarnings);
    let cross: Vec<_> = result
        .warnings
        .iter()
        .filter(|f| f.category == "cross-rig")
        .collect();
    assert_eq!(cross.len(), 1);
    assert_eq!(cross[0].bead_ids, ids(&["bx-ttt01"]));

    let convoy = result.convoy_id.expect("convoy");
    let stored = store.get(&convoy).expect("stored convoy");
    assert_eq!(stored.status, BeadStatus::StagedWarnings);
}

//! Scheduler and dispatcher tests: idempotent enqueue, fail-closed
//! introspection, capacity-bounded draining, and wave reconciliation.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use gt_core::types::{BeadId, BeadStatus, BeadType, EdgeType, SlingContext};
use gt_dispatch::scheduler::{Dispatcher, ScheduleError, Scheduler};
use gt_dispatch::sling::SlingExecutor;
use gt_store::context::open_contexts;
use gt_store::memory::MemStore;
use gt_store::BeadStore;

use common::{test_env, MockProvisioner, MockSessionHost};

struct Fixture {
    _tmp: tempfile::TempDir,
    store: Arc<MemStore>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
}

fn fixture_with(max_polecats: i32, max_per_rig: u32) -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut env = test_env(tmp.path());
    env.config.dispatch.max_polecats = max_polecats;
    env.config.dispatch.max_per_rig = max_per_rig;

    let store = Arc::new(MemStore::new());
    let provisioner = Arc::new(MockProvisioner::new(Arc::clone(&store)));
    let sessions = Arc::new(MockSessionHost::new());

    let store_dyn: Arc<dyn BeadStore> = Arc::clone(&store) as Arc<dyn BeadStore>;
    let scheduler = Scheduler::new(env.clone(), Arc::clone(&store_dyn));
    let executor = SlingExecutor::new(env, store_dyn, provisioner, sessions);
    let dispatcher = Dispatcher::new(executor);

    Fixture {
        _tmp: tmp,
        store,
        scheduler,
        dispatcher,
    }
}

fn fixture() -> Fixture {
    fixture_with(4, 4)
}

fn ctx_for(bead: &str, rig: &str) -> SlingContext {
    SlingContext::new(BeadId::from(bead), rig)
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[tokio::test]
async fn schedule_creates_one_context_and_a_convoy() {
    let f = fixture();
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");

    let outcome = f
        .scheduler
        .schedule(
            &BeadId::from("gt-ttt01"),
            "gastown",
            ctx_for("gt-ttt01", "gastown"),
            false,
            false,
        )
        .await
        .expect("schedule");

    assert!(!outcome.already_scheduled);
    let context_id = outcome.context_id.expect("context id");
    assert!(context_id.as_str().starts_with("hq-sc-"));
    assert!(outcome.convoy.is_some());

    let contexts = open_contexts(f.store.as_ref()).await.expect("contexts");
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].1.work_bead, BeadId::from("gt-ttt01"));
    // The convoy link was written back into the persisted context.
    assert_eq!(contexts[0].1.convoy, outcome.convoy);
}

#[tokio::test]
async fn scheduling_twice_is_a_no_op() {
    let f = fixture();
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");

    let first = f
        .scheduler
        .schedule(
            &BeadId::from("gt-ttt01"),
            "gastown",
            ctx_for("gt-ttt01", "gastown"),
            false,
            false,
        )
        .await
        .expect("first");

    let second = f
        .scheduler
        .schedule(
            &BeadId::from("gt-ttt01"),
            "gastown",
            ctx_for("gt-ttt01", "gastown"),
            false,
            false,
        )
        .await
        .expect("second");

    assert!(second.already_scheduled);
    assert_eq!(second.context_id, first.context_id);

    let contexts = open_contexts(f.store.as_ref()).await.expect("contexts");
    assert_eq!(contexts.len(), 1, "no duplicate contexts");
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let f = fixture();
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    f.store.add_formula("mol-polish");

    let mut ctx = ctx_for("gt-ttt01", "gastown");
    ctx.formula = Some("mol-polish".into());

    let outcome = f
        .scheduler
        .schedule(&BeadId::from("gt-ttt01"), "gastown", ctx, false, true)
        .await
        .expect("dry run");

    assert!(outcome.context_id.is_none());
    assert!(f.store.op_log().is_empty(), "dry run must not write");
    assert!(open_contexts(f.store.as_ref()).await.expect("contexts").is_empty());
}

#[tokio::test]
async fn schedule_rejects_cross_rig_unknown_rig_and_hooked() {
    let f = fixture();
    f.store.put_simple("bx-ttt01", BeadType::Task, BeadStatus::Open, "boxcar");
    f.store.put_simple("gt-hkd01", BeadType::Task, BeadStatus::Hooked, "gastown");

    let err = f
        .scheduler
        .schedule(
            &BeadId::from("bx-ttt01"),
            "gastown",
            ctx_for("bx-ttt01", "gastown"),
            false,
            false,
        )
        .await
        .expect_err("cross-rig");
    assert!(matches!(err, ScheduleError::Guard(_)));

    let err = f
        .scheduler
        .schedule(
            &BeadId::from("bx-ttt01"),
            "junkyard",
            ctx_for("bx-ttt01", "junkyard"),
            false,
            false,
        )
        .await
        .expect_err("unknown rig");
    assert!(matches!(err, ScheduleError::UnknownRig(_)));

    let err = f
        .scheduler
        .schedule(
            &BeadId::from("gt-hkd01"),
            "gastown",
            ctx_for("gt-hkd01", "gastown"),
            false,
            false,
        )
        .await
        .expect_err("hooked");
    assert!(matches!(err, ScheduleError::HookedOrPinned(_, _)));
}

#[tokio::test]
async fn schedule_requires_the_formula_to_exist() {
    let f = fixture();
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");

    let mut ctx = ctx_for("gt-ttt01", "gastown");
    ctx.formula = Some("mol-ghost".into());

    let err = f
        .scheduler
        .schedule(&BeadId::from("gt-ttt01"), "gastown", ctx, false, false)
        .await
        .expect_err("missing formula");
    assert!(matches!(err, ScheduleError::NoFormula(_)));
}

// ---------------------------------------------------------------------------
// areScheduled
// ---------------------------------------------------------------------------

#[tokio::test]
async fn are_scheduled_returns_the_open_subset() {
    let f = fixture();
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    f.store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");

    f.scheduler
        .schedule(
            &BeadId::from("gt-ttt01"),
            "gastown",
            ctx_for("gt-ttt01", "gastown"),
            false,
            false,
        )
        .await
        .expect("schedule");

    let queried = vec![BeadId::from("gt-ttt01"), BeadId::from("gt-ttt02")];
    let scheduled = f.scheduler.are_scheduled(&queried).await;
    assert_eq!(scheduled, vec![BeadId::from("gt-ttt01")]);
}

#[tokio::test]
async fn are_scheduled_fails_closed_on_read_errors() {
    let f = fixture();
    f.store.fail_reads.store(true, Ordering::SeqCst);

    let queried = vec![BeadId::from("gt-ttt01"), BeadId::from("gt-ttt02")];
    let scheduled = f.scheduler.are_scheduled(&queried).await;
    // The whole query set is reported as scheduled.
    assert_eq!(scheduled, queried);
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_drains_contexts_and_closes_them() {
    let f = fixture();
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    f.store.put_simple("bx-ttt01", BeadType::Task, BeadStatus::Open, "boxcar");

    f.scheduler
        .schedule(
            &BeadId::from("gt-ttt01"),
            "gastown",
            ctx_for("gt-ttt01", "gastown"),
            false,
            false,
        )
        .await
        .expect("schedule gt");
    f.scheduler
        .schedule(
            &BeadId::from("bx-ttt01"),
            "boxcar",
            ctx_for("bx-ttt01", "boxcar"),
            false,
            false,
        )
        .await
        .expect("schedule bx");

    let reports = f.dispatcher.dispatch_pending().await.expect("drain");
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.outcome.success));

    // Contexts closed; beads hooked.
    assert!(open_contexts(f.store.as_ref()).await.expect("contexts").is_empty());
    assert_eq!(
        f.store.get(&BeadId::from("gt-ttt01")).expect("bead").status,
        BeadStatus::Hooked
    );
    assert_eq!(
        f.store.get(&BeadId::from("bx-ttt01")).expect("bead").status,
        BeadStatus::Hooked
    );
}

#[tokio::test]
async fn dispatch_honors_the_per_rig_cap() {
    let f = fixture_with(4, 1);
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Open, "gastown");
    f.store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");

    for bead in ["gt-ttt01", "gt-ttt02"] {
        f.scheduler
            .schedule(
                &BeadId::from(bead),
                "gastown",
                ctx_for(bead, "gastown"),
                false,
                false,
            )
            .await
            .expect("schedule");
    }

    let first_pass = f.dispatcher.dispatch_pending().await.expect("pass 1");
    assert_eq!(first_pass.len(), 1, "one sling per rig per pass");
    assert_eq!(
        open_contexts(f.store.as_ref()).await.expect("contexts").len(),
        1
    );

    let second_pass = f.dispatcher.dispatch_pending().await.expect("pass 2");
    assert_eq!(second_pass.len(), 1);
    assert!(open_contexts(f.store.as_ref()).await.expect("contexts").is_empty());
}

#[tokio::test]
async fn failed_dispatch_leaves_the_context_open() {
    let f = fixture();
    // The context's bead does not exist: the sling fails.
    let ctx = ctx_for("gt-gone1", "gastown");
    gt_store::context::create_context(f.store.as_ref(), &ctx)
        .await
        .expect("raw context");

    let reports = f.dispatcher.dispatch_pending().await.expect("drain");
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].outcome.success);
    assert_eq!(
        open_contexts(f.store.as_ref()).await.expect("contexts").len(),
        1,
        "failed dispatch keeps the context for the next pass"
    );
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_dispatches_the_next_wave_when_the_previous_closes() {
    let f = fixture();
    f.store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::Open, "");
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Closed, "gastown");
    f.store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");
    f.store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);
    f.store.link("hq-cv-alpha", "gt-ttt02", EdgeType::Tracks);
    f.store.link("gt-ttt02", "gt-ttt01", EdgeType::Blocks);

    let report = f
        .dispatcher
        .reconcile_convoy(&BeadId::from("hq-cv-alpha"))
        .await
        .expect("reconcile");

    assert!(!report.convoy_closed);
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].bead_id, BeadId::from("gt-ttt02"));
    assert!(report.dispatched[0].success);
}

#[tokio::test]
async fn reconcile_skips_waves_with_running_tasks() {
    let f = fixture();
    f.store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::Open, "");
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Hooked, "gastown");
    f.store.put_simple("gt-ttt02", BeadType::Task, BeadStatus::Open, "gastown");
    f.store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);
    f.store.link("hq-cv-alpha", "gt-ttt02", EdgeType::Tracks);
    f.store.link("gt-ttt02", "gt-ttt01", EdgeType::Blocks);

    let report = f
        .dispatcher
        .reconcile_convoy(&BeadId::from("hq-cv-alpha"))
        .await
        .expect("reconcile");

    // Wave 1 is still running; nothing new dispatches.
    assert!(report.dispatched.is_empty());
}

#[tokio::test]
async fn reconcile_closes_a_finished_convoy() {
    let f = fixture();
    f.store.put_simple("hq-cv-alpha", BeadType::Convoy, BeadStatus::Open, "");
    f.store.put_simple("gt-ttt01", BeadType::Task, BeadStatus::Closed, "gastown");
    f.store.link("hq-cv-alpha", "gt-ttt01", EdgeType::Tracks);

    let report = f
        .dispatcher
        .reconcile_convoy(&BeadId::from("hq-cv-alpha"))
        .await
        .expect("reconcile");

    assert!(report.convoy_closed);
    assert_eq!(
        f.store.get(&BeadId::from("hq-cv-alpha")).expect("convoy").status,
        BeadStatus::Closed
    );
}

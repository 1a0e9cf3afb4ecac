mod common;

use common::Harness;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snapshot_bridge::adapters::memory::{Fault, Op};
use snapshot_bridge::adapters::SnapshotAdapter;
use snapshot_bridge::config::{RetentionLimits, RetentionPolicy};
use snapshot_bridge::error::PermanentReason;
use snapshot_bridge::models::action::{ActionKind, ActionPlanItem};
use snapshot_bridge::models::backup::{BackupRecord, Side};
use snapshot_bridge::services::catalog::SnapshotCatalog;
use snapshot_bridge::services::cycle::{CycleStatus, Trigger};
use snapshot_bridge::services::executor::Outcome;
use snapshot_bridge::services::planner;
use snapshot_bridge::services::sync_scheduler::{CycleControl, Phase, Requested, SyncScheduler};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn kinds(plan: &[ActionPlanItem]) -> Vec<(ActionKind, &str)> {
    plan.iter().map(|i| (i.kind, i.backup_id.as_str())).collect()
}

#[tokio::test]
async fn test_five_local_three_remote_settles_at_limit() {
    let h = Harness::new().await;
    for (i, id) in ["b1", "b2", "b3", "b4", "b5"].iter().enumerate() {
        h.seed(id, 50 - 10 * i as i64, true, i < 3);
    }
    h.settings(|s| s.retention.remote.max_count = Some(3)).await;

    let report = h.cycle().await;
    assert_eq!(report.status, CycleStatus::Succeeded);
    assert_eq!(
        kinds(&report.plan),
        vec![
            (ActionKind::Upload, "b5"),
            (ActionKind::Upload, "b4"),
            (ActionKind::DeleteRemote, "b1"),
            (ActionKind::DeleteRemote, "b2"),
        ]
    );
    assert_eq!(h.remote.snapshots().len(), 3);
    for id in ["b3", "b4", "b5"] {
        assert_eq!(h.remote.copies_of(id), 1);
    }
    assert_eq!(h.local.snapshots().len(), 5);

    // Converged: the next cycle has nothing to do.
    let again = h.cycle().await;
    assert!(again.plan.is_empty(), "unexpected plan {:?}", kinds(&again.plan));
}

#[tokio::test]
async fn test_transient_failures_retry_with_growing_backoff() {
    let h = Harness::new().await;
    h.seed("b1", 1, true, false);
    h.remote.inject(Op::Write, Some("b1"), Fault::Transient { times: 3 });

    let report = h.cycle().await;
    assert_eq!(report.status, CycleStatus::Succeeded);

    let result = report.execution.result_for("b1").unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.item.attempt, 4);
    let delays = &result.item.retry_delays_ms;
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] < w[1]), "delays must grow: {delays:?}");

    assert_eq!(h.remote.calls(Op::Write), 4);
    assert_eq!(h.remote.copies_of("b1"), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_backup() {
    let h = Harness::new().await;
    h.seed("b1", 1, true, false);
    h.seed("b2", 2, true, false);
    h.settings(|s| s.max_attempts = 2).await;
    h.remote.inject(Op::Write, Some("b2"), Fault::Transient { times: 10 });

    let report = h.cycle().await;
    assert_eq!(report.status, CycleStatus::PartialFailure);
    assert_eq!(report.execution.result_for("b2").unwrap().item.attempt, 2);
    assert!(h.remote.contains("b1"));
    assert!(!h.remote.contains("b2"));
}

#[tokio::test]
async fn test_permanent_failure_is_isolated() {
    let h = Harness::new().await;
    for (id, age) in [("b1", 3), ("b2", 2), ("b3", 1)] {
        h.seed(id, age, true, false);
    }
    h.remote.inject(Op::Write, Some("b2"), Fault::Permanent(PermanentReason::QuotaExceeded));

    let report = h.cycle().await;
    assert_eq!(report.status, CycleStatus::PartialFailure);
    assert!(h.remote.contains("b1"));
    assert!(h.remote.contains("b3"));
    assert!(!h.remote.contains("b2"));
    // Permanent failures are not retried.
    assert_eq!(report.execution.result_for("b2").unwrap().item.attempt, 1);

    let record = h.store().find_record("b2").await.unwrap().unwrap();
    assert!(record.last_error.unwrap().contains("QuotaExceeded"));
    let failure = h.store().last_failure().await.unwrap().unwrap();
    assert_eq!(failure.status, "partial_failure");
    assert_eq!(failure.failed, 1);
    assert_eq!(failure.succeeded, 2);

    // Once the quota is freed the next cycle picks the backup up again.
    h.remote.clear_faults();
    let report = h.cycle().await;
    assert_eq!(kinds(&report.plan), vec![(ActionKind::Upload, "b2")]);
    assert_eq!(report.status, CycleStatus::Succeeded);
    assert!(h.store().find_record("b2").await.unwrap().unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_old_local_only_backup_keeps_a_copy_until_both_limits_apply() {
    let h = Harness::new().await;
    h.seed("b0", 60, true, false);
    h.seed("b1", 50, true, true);
    h.seed("b2", 40, true, true);
    h.settings(|s| {
        s.retention.local.max_count = Some(2);
        s.retention.remote.max_count = Some(2);
    })
    .await;

    let expected = [
        vec![(ActionKind::Upload, "b0")],
        vec![(ActionKind::DeleteRemote, "b0")],
        vec![(ActionKind::DeleteLocal, "b0")],
    ];
    for (step, want) in expected.iter().enumerate() {
        let report = h.cycle().await;
        assert_eq!(&kinds(&report.plan), want, "cycle {step}");
        assert_eq!(report.status, CycleStatus::Succeeded);
        if step < 2 {
            assert!(h.local.contains("b0") || h.remote.contains("b0"), "b0 lost every copy in cycle {step}");
        }
    }
    assert!(!h.local.contains("b0") && !h.remote.contains("b0"));
    assert!(h.store().find_record("b0").await.unwrap().is_none());
    assert!(h.cycle().await.plan.is_empty());
}

#[tokio::test]
async fn test_remote_only_backup_is_not_aged_out() {
    let h = Harness::new().await;
    h.seed("r0", 60, false, true);
    h.seed("r1", 10, true, true);
    h.settings(|s| s.retention.remote.max_count = Some(1)).await;

    let report = h.cycle().await;
    assert!(report.plan.is_empty(), "unexpected plan {:?}", kinds(&report.plan));
    assert!(h.remote.contains("r0"));
    assert_eq!(h.remote.calls(Op::Delete), 0);
}

#[tokio::test]
async fn test_untagged_remote_copy_is_linked_not_reuploaded() {
    let h = Harness::new().await;
    let created = common::hours_ago(3);
    h.local.seed("b1", "Full b1", created);
    h.remote.seed_untagged("Full b1", created);

    let report = h.cycle().await;
    assert!(report.plan.is_empty(), "unexpected plan {:?}", kinds(&report.plan));
    assert_eq!(h.remote.calls(Op::Write), 0);
    let record = h.store().find_record("b1").await.unwrap().unwrap();
    assert!(record.presence.contains(Side::Remote));
}

#[tokio::test]
async fn test_revoked_credentials_stop_the_remote_side() {
    let h = Harness::new().await;
    for (i, id) in ["b1", "b2", "b3", "b4"].iter().enumerate() {
        h.seed(id, 100 - i as i64, true, true);
    }
    h.seed("b5", 10, true, false);
    h.seed("b6", 5, true, false);
    h.settings(|s| {
        s.concurrency = 1;
        s.retention.remote.max_count = Some(4);
    })
    .await;
    h.remote.inject(Op::Write, None, Fault::Permanent(PermanentReason::Unauthorized));

    let report = h.cycle().await;
    assert_eq!(report.status, CycleStatus::AuthorizationFailed);
    assert!(report.execution.revoked.contains(Side::Remote));
    // Only the first upload reached the drive; nothing was deleted.
    assert_eq!(h.remote.calls(Op::Write), 1);
    assert_eq!(h.remote.calls(Op::Delete), 0);
    assert_eq!(h.remote.snapshots().len(), 4);
    assert_eq!(report.execution.failed(), 2);
}

#[tokio::test]
async fn test_restart_after_crash_does_not_upload_twice() {
    let h = Harness::new().await;
    h.seed("b1", 1, true, false);
    h.remote.set_delay(Duration::from_millis(500));

    // Crash while the upload is in flight.
    let engine = h.engine.clone();
    let running = tokio::spawn(async move {
        engine.run_cycle(Trigger::Startup, &CancellationToken::new()).await
    });
    for _ in 0..400 {
        if !h.store().inflight().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    running.abort();
    let _ = running.await;
    let markers = h.store().inflight().await.unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].kind, ActionKind::Upload);

    h.remote.set_delay(Duration::ZERO);
    let restarted = h.restart();
    let report = restarted.run_cycle(Trigger::Startup, &CancellationToken::new()).await;

    assert_eq!(report.status, CycleStatus::Succeeded);
    let result = report.execution.result_for("b1").unwrap();
    assert_eq!(result.item.attempt, 2, "the retry count continues across the restart");
    assert_eq!(h.remote.copies_of("b1"), 1);
    assert!(restarted.store.inflight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_does_not_extend_a_spent_attempt_budget() {
    let h = Harness::new().await;
    h.settings(|s| s.max_attempts = 2).await;
    h.seed("b1", 1, true, false);
    let mut marker = ActionPlanItem::new(ActionKind::Upload, "b1");
    marker.attempt = 2;
    h.store().mark_inflight(marker).await.unwrap();

    let report = h.restart().run_cycle(Trigger::Startup, &CancellationToken::new()).await;
    assert_eq!(report.status, CycleStatus::PartialFailure);
    assert_eq!(h.remote.calls(Op::Write), 0);
    assert!(h.store().inflight().await.unwrap().is_empty());

    // A later cycle plans the upload afresh.
    let report = h.cycle().await;
    assert_eq!(report.status, CycleStatus::Succeeded);
    assert_eq!(report.execution.result_for("b1").unwrap().item.attempt, 1);
    assert!(h.remote.contains("b1"));
}

#[tokio::test]
async fn test_recovery_confirms_upload_that_landed_before_crash() {
    let h = Harness::new().await;
    h.seed("b1", 1, true, true);
    let mut marker = ActionPlanItem::new(ActionKind::Upload, "b1");
    marker.attempt = 1;
    h.store().mark_inflight(marker).await.unwrap();

    let report = h.restart().run_cycle(Trigger::Startup, &CancellationToken::new()).await;
    assert!(report.plan.is_empty());
    assert_eq!(h.remote.calls(Op::Write), 0);
    assert_eq!(h.remote.copies_of("b1"), 1);
    assert!(h.store().inflight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_plan_preview_is_stable_without_changes() {
    let h = Harness::new().await;
    h.seed("b1", 30, true, true);
    h.seed("b2", 20, false, true);
    h.seed("b3", 10, true, false);
    h.remote.inject(Op::Write, None, Fault::Permanent(PermanentReason::QuotaExceeded));
    h.settings(|s| s.retention.local.max_count = Some(1)).await;
    h.cycle().await;

    let first = h.engine.preview_plan().await.unwrap();
    let second = h.engine.preview_plan().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_protected_backup_survives_retention() {
    let h = Harness::new().await;
    h.seed("b1", 30, true, true);
    h.seed("b2", 20, true, true);
    h.seed("b3", 10, true, true);
    assert!(h.cycle().await.plan.is_empty());

    assert!(h.store().set_protected("b1", true).await.unwrap());
    h.settings(|s| s.retention.remote.max_count = Some(2)).await;

    let report = h.cycle().await;
    assert_eq!(kinds(&report.plan), vec![(ActionKind::DeleteRemote, "b2")]);
    assert!(h.remote.contains("b1"));
    assert!(!h.remote.contains("b2"));
    assert!(h.local.contains("b2"));
}

#[tokio::test]
async fn test_protection_is_written_to_and_recovered_from_the_remote_copy() {
    let h = Harness::new().await;
    h.seed("b1", 30, true, true);
    h.seed("b2", 20, true, true);
    assert!(h.cycle().await.plan.is_empty());
    assert_eq!(h.remote.calls(Op::Update), 0);

    assert!(h.store().set_protected("b1", true).await.unwrap());
    h.cycle().await;
    assert_eq!(h.remote.protected_tag("b1"), Some(true));
    assert_eq!(h.remote.calls(Op::Update), 1);

    // A new state database learns protection from the tag and keeps b1.
    let fresh = Harness::new().await;
    for snapshot in h.local.snapshots() {
        fresh.local.seed(snapshot.handle.as_str(), &snapshot.name, snapshot.created_at);
    }
    for snapshot in h.remote.snapshots() {
        let id = snapshot.backup_id.unwrap();
        fresh.remote.seed(&id, &snapshot.name, snapshot.created_at);
        fresh.remote.tag_protected(&id, snapshot.protected);
    }
    fresh
        .settings(|s| {
            s.retention.local.max_count = Some(1);
            s.retention.remote.max_count = Some(1);
        })
        .await;

    let report = fresh.cycle().await;
    assert!(fresh.store().find_record("b1").await.unwrap().unwrap().protected);
    assert!(fresh.local.contains("b1") && fresh.remote.contains("b1"));
    assert!(report.plan.iter().all(|i| i.backup_id != "b1"));
    assert_eq!(fresh.remote.calls(Op::Update), 0);

    // Unprotecting rewrites the tag rather than being overridden by it.
    fresh
        .settings(|s| {
            s.retention.local.max_count = None;
            s.retention.remote.max_count = None;
        })
        .await;
    assert!(fresh.store().set_protected("b1", false).await.unwrap());
    fresh.cycle().await;
    assert_eq!(fresh.remote.protected_tag("b1"), Some(false));
    assert!(!fresh.store().find_record("b1").await.unwrap().unwrap().protected);
}

#[tokio::test]
async fn test_event_history_ends_with_the_backup() {
    let h = Harness::new().await;
    h.seed("b1", 2, true, false);
    h.seed("b2", 1, true, false);
    h.cycle().await;
    assert!(!h.engine.events.history("b1", 0).is_empty());

    for snapshot in h.remote.snapshots().into_iter().chain(h.local.snapshots()) {
        if snapshot.backup_id.as_deref() == Some("b1") {
            let store = if snapshot.side == Side::Local { &h.local } else { &h.remote };
            store.delete(&snapshot.handle).await.unwrap();
        }
    }
    h.cycle().await;

    assert!(h.engine.events.history("b1", 0).is_empty());
    assert!(!h.engine.events.history("b2", 0).is_empty());
}

#[tokio::test]
async fn test_restore_request_downloads_then_clears() {
    let h = Harness::new().await;
    h.seed("b1", 5, false, true);
    h.cycle().await;
    assert!(h.store().set_restore_requested("b1", true).await.unwrap());

    let report = h.cycle().await;
    assert_eq!(kinds(&report.plan), vec![(ActionKind::Download, "b1")]);
    assert!(h.local.contains("b1"));
    let record = h.store().find_record("b1").await.unwrap().unwrap();
    assert!(!record.restore_requested);
    assert!(h.cycle().await.plan.is_empty());
}

fn random_limits(rng: &mut StdRng) -> RetentionLimits {
    RetentionLimits {
        max_count: rng.gen_bool(0.7).then(|| rng.gen_range(0..5)),
        max_age_days: rng.gen_bool(0.3).then(|| rng.gen_range(1..10)),
    }
}

#[test]
fn test_random_catalogs_respect_retention_guards() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let now = Utc::now();

    for round in 0..300 {
        let records: Vec<BackupRecord> = (0..rng.gen_range(0..12))
            .map(|i| {
                let id = format!("b{i}");
                let created = now - chrono::Duration::hours(rng.gen_range(0..24 * 14));
                let mut r = BackupRecord::new(id.clone(), id.clone(), created, 1);
                match rng.gen_range(0..3) {
                    0 => r.add_copy(Side::Local, id.clone()),
                    1 => r.add_copy(Side::Remote, format!("file-{id}")),
                    _ => {
                        r.add_copy(Side::Local, id.clone());
                        r.add_copy(Side::Remote, format!("file-{id}"));
                    }
                }
                for side in [Side::Local, Side::Remote] {
                    if !r.presence.contains(side) && rng.gen_bool(0.3) {
                        r.retired.insert(side);
                    }
                }
                r.protected = rng.gen_bool(0.15);
                r.restore_requested = !r.protected && rng.gen_bool(0.1);
                r
            })
            .collect();
        let policy = RetentionPolicy {
            local: random_limits(&mut rng),
            remote: random_limits(&mut rng),
            delete_first: if rng.gen_bool(0.5) { Side::Local } else { Side::Remote },
        };
        let catalog = SnapshotCatalog::from_records(records);

        let plan = planner::plan(&catalog, &policy, now, &[]);
        assert_eq!(plan, planner::plan(&catalog, &policy, now, &[]), "round {round}: plan is not stable");

        let ids: BTreeSet<&str> = plan.iter().map(|i| i.backup_id.as_str()).collect();
        assert_eq!(ids.len(), plan.len(), "round {round}: duplicate backup in plan");

        let first_delete = plan.iter().position(|i| i.kind.is_delete()).unwrap_or(plan.len());
        assert!(
            plan[first_delete..].iter().all(|i| i.kind.is_delete()),
            "round {round}: transfers must precede deletions"
        );

        for item in plan.iter().filter(|i| i.kind.is_delete()) {
            let record = catalog.get(&item.backup_id).unwrap();
            let side = item.kind.target();
            assert!(record.presence.contains(side), "round {round}: deleting a missing copy");
            assert!(!record.pinned().contains(side), "round {round}: deleted a pinned copy of {}", record.id);
            assert!(
                record.presence.contains(side.other()) || record.retired.contains(side.other()),
                "round {round}: {} would lose its only copy without the other side being retired",
                record.id
            );
            if !record.presence.contains(side.other()) {
                assert!(
                    !record.pinned().contains(side.other()),
                    "round {round}: {} lost its only copy while still wanted",
                    record.id
                );
            }
        }
    }
}

#[tokio::test]
async fn test_requests_during_a_cycle_coalesce_into_one() {
    let h = Harness::new().await;
    h.seed("b1", 1, true, false);
    h.local.set_delay(Duration::from_millis(100));

    let control = CycleControl::new(CancellationToken::new());
    let scheduler = SyncScheduler::start(h.engine.clone(), control.clone());
    for _ in 0..200 {
        if control.phase() == Phase::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(control.request(Trigger::Manual), Requested::Queued);
    assert_eq!(control.request(Trigger::Manual), Requested::Coalesced);
    assert_eq!(control.request(Trigger::Manual), Requested::Coalesced);

    for _ in 0..400 {
        let status = control.status();
        if status.phase == Phase::Idle && status.pending.is_none() && h.store().recent_cycles(10).await.unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let cycles = h.store().recent_cycles(10).await.unwrap();
    assert_eq!(cycles.len(), 2);
    let triggers: BTreeSet<&str> = cycles.iter().map(|c| c.trigger.as_str()).collect();
    assert_eq!(triggers, BTreeSet::from(["startup", "manual"]));
    assert_eq!(h.remote.copies_of("b1"), 1);

    scheduler.shutdown().await;
    assert_eq!(control.phase(), Phase::Stopped);
    assert_eq!(control.request(Trigger::Manual), Requested::Stopped);
}

use std::sync::Arc;
use std::time::Duration;

use tau_core::ManualClock;
use tau_event_locks::EventLockCoordinator;
use tau_slowmode::{
    CapabilitySet, LeaseStore, RecordingBotAlertSink, RecordingSlowmodePlatform, SlowmodeConfig,
    SlowmodeEnforcer, SlowmodeEnforcerConfig, SlowmodeInboundEvent, SlowmodeOutcome,
    SqliteLeaseStore, StaticPermissionProvider, SLOWMODE_REASON_LEASE_ALREADY_ACTIVE,
};
use tempfile::tempdir;

const START_UNIX_MS: u64 = 1_700_000_000_000;

struct Process {
    store: Arc<SqliteLeaseStore>,
    platform: Arc<RecordingSlowmodePlatform>,
    enforcer: SlowmodeEnforcer,
}

/// One bot process: its own store handle, lock table and platform client.
fn start_process(db_path: &std::path::Path, clock: &ManualClock) -> Process {
    let store = Arc::new(SqliteLeaseStore::new(db_path).expect("open sqlite store"));
    let platform = Arc::new(RecordingSlowmodePlatform::new());
    let enforcer = SlowmodeEnforcer::new(SlowmodeEnforcerConfig {
        store: store.clone(),
        locks: EventLockCoordinator::new(),
        permissions: Arc::new(StaticPermissionProvider::new()),
        platform: platform.clone(),
        alerts: Arc::new(RecordingBotAlertSink::new()),
        clock: Arc::new(clock.clone()),
        required_capabilities: CapabilitySet::bot_slowmode_default(),
        expiry_timers_enabled: false,
    });
    Process {
        store,
        platform,
        enforcer,
    }
}

fn message(message_id: &str, user_id: &str) -> SlowmodeInboundEvent {
    SlowmodeInboundEvent::new(message_id, "c-1", user_id)
}

#[tokio::test]
async fn integration_restriction_self_reverts_after_restart() {
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("slowmode.sqlite");
    let clock = ManualClock::new(START_UNIX_MS);

    let first = start_process(&db_path, &clock);
    first
        .store
        .save_config(SlowmodeConfig::new("c-1", 30))
        .await
        .expect("save config");
    let outcome = first
        .enforcer
        .handle_inbound_event(&message("m-1", "u-1"))
        .await;
    assert!(matches!(outcome, SlowmodeOutcome::LeaseApplied { .. }));
    drop(first);

    clock.advance(Duration::from_secs(10));
    let second = start_process(&db_path, &clock);
    let early = second.enforcer.recover_leases().await.expect("recover");
    assert_eq!(early.sweep.lifted, 0);
    assert_eq!(early.active_leases, 1);
    let suppressed = second
        .enforcer
        .handle_inbound_event(&message("m-2", "u-1"))
        .await;
    assert!(matches!(suppressed, SlowmodeOutcome::Suppressed { .. }));
    drop(second);

    clock.advance(Duration::from_secs(25));
    let third = start_process(&db_path, &clock);
    let report = third.enforcer.recover_leases().await.expect("recover");
    assert_eq!(report.sweep.lifted, 1);
    assert_eq!(report.active_leases, 0);
    assert_eq!(third.platform.lift_attempts(), 1);
    assert!(third
        .store
        .list_leases(None)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_two_processes_racing_one_author_apply_one_restriction() {
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("slowmode.sqlite");
    let clock = ManualClock::new(START_UNIX_MS);
    let left = start_process(&db_path, &clock);
    let right = start_process(&db_path, &clock);
    left.store
        .save_config(SlowmodeConfig::new("c-1", 60))
        .await
        .expect("save config");

    let mut tasks = Vec::new();
    for index in 0..8 {
        let enforcer = if index % 2 == 0 {
            left.enforcer.clone()
        } else {
            right.enforcer.clone()
        };
        let event = message(&format!("m-{index}"), "u-1");
        tasks.push(tokio::spawn(async move {
            enforcer.handle_inbound_event(&event).await
        }));
    }

    let mut applied = 0;
    for task in tasks {
        match task.await.expect("join") {
            SlowmodeOutcome::LeaseApplied { .. } => applied += 1,
            SlowmodeOutcome::Suppressed { .. } => {}
            SlowmodeOutcome::NoOp { reason_code, .. } => {
                assert_eq!(reason_code, SLOWMODE_REASON_LEASE_ALREADY_ACTIVE)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(
        left.platform.restriction_attempts() + right.platform.restriction_attempts(),
        1
    );
    assert_eq!(
        left.store.list_leases(Some("c-1")).await.expect("list").len(),
        1
    );
}

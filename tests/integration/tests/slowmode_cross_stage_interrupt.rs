use std::sync::Arc;

use tau_event_locks::{EventLockCoordinator, EventLockHandle, LockFlow};
use tau_slowmode::{
    InMemoryLeaseStore, LeaseStore, RecordingSlowmodePlatform, SlowmodeConfig, SlowmodeEnforcer,
    SlowmodeEnforcerConfig, SlowmodeInboundEvent, SlowmodeOutcome, SlowmodePlatform,
    StaticPermissionProvider, SLOWMODE_REASON_MESSAGE_INTERRUPTED,
};

/// Content filter stage that deletes messages containing a banned word.
async fn run_word_filter(
    locks: &EventLockCoordinator,
    platform: &RecordingSlowmodePlatform,
    event: &SlowmodeInboundEvent,
) -> bool {
    let mut lock: EventLockHandle = locks.acquire(event.message_lock_key()).await;
    if lock.flow() == LockFlow::Interrupted || !event.content.contains("banned") {
        return false;
    }
    platform
        .delete_message(&event.channel_id, &event.message_id)
        .await
        .expect("filter delete");
    lock.interrupt()
}

async fn enforcer_with(
    locks: &EventLockCoordinator,
    platform: Arc<RecordingSlowmodePlatform>,
) -> SlowmodeEnforcer {
    let store = Arc::new(InMemoryLeaseStore::new());
    store
        .save_config(SlowmodeConfig::new("c-1", 10))
        .await
        .expect("save config");
    let mut config = SlowmodeEnforcerConfig::new(
        store,
        Arc::new(StaticPermissionProvider::new()),
        platform,
    );
    config.locks = locks.clone();
    config.expiry_timers_enabled = false;
    SlowmodeEnforcer::new(config)
}

#[tokio::test]
async fn integration_filtered_message_is_not_enforced_twice() {
    let locks = EventLockCoordinator::new();
    let platform = Arc::new(RecordingSlowmodePlatform::new());
    let enforcer = enforcer_with(&locks, platform.clone()).await;

    let mut event = SlowmodeInboundEvent::new("m-1", "c-1", "u-1");
    event.content = "a banned phrase".to_string();
    assert!(run_word_filter(&locks, &platform, &event).await);

    let outcome = enforcer.handle_inbound_event(&event).await;
    assert_eq!(outcome.reason_code(), SLOWMODE_REASON_MESSAGE_INTERRUPTED);
    assert_eq!(platform.delete_attempts(), 1);
    assert_eq!(platform.restriction_attempts(), 0);
}

#[tokio::test]
async fn integration_suppressed_message_interrupts_later_filter() {
    let locks = EventLockCoordinator::new();
    let platform = Arc::new(RecordingSlowmodePlatform::new());
    let enforcer = enforcer_with(&locks, platform.clone()).await;

    enforcer
        .on_inbound_event(&SlowmodeInboundEvent::new("m-1", "c-1", "u-1"))
        .await;
    let mut second = SlowmodeInboundEvent::new("m-2", "c-1", "u-1");
    second.content = "banned again".to_string();
    let outcome = enforcer.handle_inbound_event(&second).await;
    assert!(matches!(outcome, SlowmodeOutcome::Suppressed { .. }));

    assert!(!run_word_filter(&locks, &platform, &second).await);
    assert_eq!(platform.delete_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn integration_stages_racing_on_one_message_delete_it_once() {
    let locks = EventLockCoordinator::new();
    let platform = Arc::new(RecordingSlowmodePlatform::new());
    let enforcer = enforcer_with(&locks, platform.clone()).await;
    enforcer
        .handle_inbound_event(&SlowmodeInboundEvent::new("m-1", "c-1", "u-1"))
        .await;

    let mut event = SlowmodeInboundEvent::new("m-2", "c-1", "u-1");
    event.content = "banned".to_string();
    let filter = {
        let locks = locks.clone();
        let platform = platform.clone();
        let event = event.clone();
        tokio::spawn(async move { run_word_filter(&locks, &platform, &event).await })
    };
    let enforced = {
        let enforcer = enforcer.clone();
        let event = event.clone();
        tokio::spawn(async move { enforcer.handle_inbound_event(&event).await })
    };

    let filtered = filter.await.expect("join filter");
    let outcome = enforced.await.expect("join enforcer");
    let enforcer_deleted = matches!(outcome, SlowmodeOutcome::Suppressed { .. });
    assert!(filtered ^ enforcer_deleted);
    assert_eq!(platform.delete_attempts(), 1);
}

use std::sync::Arc;

use tau_core::{ManualClock, SystemClock};
use tau_event_locks::EventLockCoordinator;

use crate::{
    CapabilitySet, InMemoryLeaseStore, LeaseStore, RecordingBotAlertSink,
    RecordingSlowmodePlatform, SlowmodeEnforcer, SlowmodeEnforcerConfig, SlowmodeInboundEvent,
    StaticPermissionProvider,
};

pub(crate) const HARNESS_START_UNIX_MS: u64 = 1_700_000_000_000;

/// Enforcer wired to recording collaborators and a manual clock.
pub(crate) struct SlowmodeHarness {
    pub store: Arc<dyn LeaseStore>,
    pub platform: Arc<RecordingSlowmodePlatform>,
    pub alerts: Arc<RecordingBotAlertSink>,
    pub clock: ManualClock,
    pub locks: EventLockCoordinator,
    pub enforcer: SlowmodeEnforcer,
}

impl SlowmodeHarness {
    pub fn new() -> Self {
        Self::build(
            Arc::new(InMemoryLeaseStore::new()),
            StaticPermissionProvider::new(),
        )
    }

    pub fn with_permissions(permissions: StaticPermissionProvider) -> Self {
        Self::build(Arc::new(InMemoryLeaseStore::new()), permissions)
    }

    pub fn with_store(store: Arc<dyn LeaseStore>) -> Self {
        Self::build(store, StaticPermissionProvider::new())
    }

    fn build(store: Arc<dyn LeaseStore>, permissions: StaticPermissionProvider) -> Self {
        let platform = Arc::new(RecordingSlowmodePlatform::new());
        let alerts = Arc::new(RecordingBotAlertSink::new());
        let clock = ManualClock::new(HARNESS_START_UNIX_MS);
        let locks = EventLockCoordinator::new();
        let enforcer = SlowmodeEnforcer::new(SlowmodeEnforcerConfig {
            store: Arc::clone(&store),
            locks: locks.clone(),
            permissions: Arc::new(permissions),
            platform: platform.clone(),
            alerts: alerts.clone(),
            clock: Arc::new(clock.clone()),
            required_capabilities: CapabilitySet::bot_slowmode_default(),
            expiry_timers_enabled: false,
        });
        Self {
            store,
            platform,
            alerts,
            clock,
            locks,
            enforcer,
        }
    }

    /// Wall clock with expiry timers armed.
    pub fn with_system_clock_timers() -> Self {
        let harness = Self::new();
        let mut config = SlowmodeEnforcerConfig::new(
            Arc::clone(&harness.store),
            Arc::new(StaticPermissionProvider::new()),
            harness.platform.clone(),
        );
        config.alerts = harness.alerts.clone();
        config.clock = Arc::new(SystemClock);
        config.locks = harness.locks.clone();
        Self {
            enforcer: SlowmodeEnforcer::new(config),
            ..harness
        }
    }

    pub fn event(&self, message_id: &str, channel_id: &str, user_id: &str) -> SlowmodeInboundEvent {
        let mut event = SlowmodeInboundEvent::new(message_id, channel_id, user_id);
        event.timestamp_ms = tau_core::Clock::now_unix_ms(&self.clock);
        event
    }
}

//! Per-message bot slowmode enforcement.
//!
//! Every inbound message runs through one state machine while its message lock
//! is held:
//!
//! `Locked -> ConfigChecked -> EligibilityChecked -> CapabilityChecked`, ending
//! in a suppression, a new lease, or a no-op. Lease reads and writes for one
//! (channel, user) pair additionally hold the pair's subject lock, which is
//! always taken after the message lock.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tau_core::{unix_ms_after, Clock, SystemClock};
use tau_event_locks::{EventLockCoordinator, EventLockHandle, EventLockKey, LockFlow};
use thiserror::Error;

use crate::slowmode_cache::SlowmodeCache;
use crate::slowmode_config::SlowmodeRuntimeConfig;
use crate::slowmode_contract::SlowmodeInboundEvent;
use crate::slowmode_eligibility::{CapabilitySet, EligibilityChecker, PermissionProvider};
use crate::slowmode_expiry::ExpiryTimerRegistry;
use crate::slowmode_platform::{
    BotAlert, BotAlertSink, SlowmodePlatform, SlowmodePlatformError, TracingBotAlertSink,
};
use crate::slowmode_store::{ActiveLease, LeaseCreation, LeaseStore, LeaseStoreError, NewLease};


/// Subject lock scope for lease mutations.
pub const SLOWMODE_SUBJECT_LOCK_SCOPE: &str = "slowmode-subject";

pub const SLOWMODE_REASON_AUTHOR_IS_BOT: &str = "slowmode_author_is_bot";
pub const SLOWMODE_REASON_CHANNEL_KIND_UNSUPPORTED: &str = "slowmode_channel_kind_unsupported";
pub const SLOWMODE_REASON_MESSAGE_INTERRUPTED: &str = "slowmode_message_already_interrupted";
pub const SLOWMODE_REASON_CHANNEL_NOT_CONFIGURED: &str = "slowmode_channel_not_configured";
pub const SLOWMODE_REASON_CHANNEL_DISABLED: &str = "slowmode_channel_disabled";
pub const SLOWMODE_REASON_CHANNEL_DISABLED_CONCURRENTLY: &str =
    "slowmode_channel_disabled_concurrently";
pub const SLOWMODE_REASON_CONFIG_LOOKUP_FAILED: &str = "slowmode_config_lookup_failed";
pub const SLOWMODE_REASON_SUBJECT_EXEMPT: &str = "slowmode_subject_exempt";
pub const SLOWMODE_REASON_ELIGIBILITY_LOOKUP_FAILED: &str = "slowmode_eligibility_lookup_failed";
pub const SLOWMODE_REASON_MISSING_CAPABILITIES: &str = "slowmode_missing_capabilities";
pub const SLOWMODE_REASON_CAPABILITY_LOOKUP_FAILED: &str = "slowmode_capability_lookup_failed";
pub const SLOWMODE_REASON_LEASE_LOOKUP_FAILED: &str = "slowmode_lease_lookup_failed";
pub const SLOWMODE_REASON_LEASE_ALREADY_ACTIVE: &str = "slowmode_lease_already_active";
pub const SLOWMODE_REASON_MESSAGE_SUPPRESSED: &str = "slowmode_message_suppressed";
pub const SLOWMODE_REASON_SUPPRESSION_FAILED: &str = "slowmode_suppression_failed";
pub const SLOWMODE_REASON_LEASE_APPLIED: &str = "slowmode_lease_applied";
pub const SLOWMODE_REASON_LEASE_APPLY_FAILED: &str = "slowmode_lease_apply_failed";
pub const SLOWMODE_REASON_HANDLER_PANICKED: &str = "slowmode_handler_panicked";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Last state-machine stage an event reached before resolving.
pub enum SlowmodeStage {
    Locked,
    ConfigChecked,
    EligibilityChecked,
    CapabilityChecked,
}

impl SlowmodeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::ConfigChecked => "config_checked",
            Self::EligibilityChecked => "eligibility_checked",
            Self::CapabilityChecked => "capability_checked",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
/// Terminal state of one processed event.
pub enum SlowmodeOutcome {
    /// Filtered before the message lock was taken.
    Ignored { reason_code: &'static str },
    NoOp {
        stage: SlowmodeStage,
        reason_code: &'static str,
    },
    /// Message deleted under an active lease; the message lock was interrupted.
    Suppressed { lease_id: String },
    /// Deletion failed; later stages still see the message as live.
    SuppressionFailed { lease_id: String, error: String },
    LeaseApplied { lease: ActiveLease },
    /// Restriction could not be applied and the lease record was rolled back.
    LeaseApplyFailed { error: String },
    Aborted { reason_code: &'static str },
}

impl SlowmodeOutcome {
    fn no_op(stage: SlowmodeStage, reason_code: &'static str) -> Self {
        Self::NoOp { stage, reason_code }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Ignored { reason_code }
            | Self::NoOp { reason_code, .. }
            | Self::Aborted { reason_code } => reason_code,
            Self::Suppressed { .. } => SLOWMODE_REASON_MESSAGE_SUPPRESSED,
            Self::SuppressionFailed { .. } => SLOWMODE_REASON_SUPPRESSION_FAILED,
            Self::LeaseApplied { .. } => SLOWMODE_REASON_LEASE_APPLIED,
            Self::LeaseApplyFailed { .. } => SLOWMODE_REASON_LEASE_APPLY_FAILED,
        }
    }

    /// True when the enforcer deleted the message or restricted the author.
    pub fn enforced(&self) -> bool {
        matches!(self, Self::Suppressed { .. } | Self::LeaseApplied { .. })
    }
}

#[derive(Debug, Error)]
pub enum LeaseApplyError {
    #[error("slowmode lease for '{user_id}' in '{channel_id}' needs a non-zero duration")]
    InvalidDuration { channel_id: String, user_id: String },
    #[error(transparent)]
    Store(#[from] LeaseStoreError),
    #[error(
        "failed to restrict '{user_id}' in '{channel_id}' (lease rolled back: {rolled_back}): {source}"
    )]
    Restriction {
        channel_id: String,
        user_id: String,
        rolled_back: bool,
        #[source]
        source: SlowmodePlatformError,
    },
}

/// Collaborators and knobs for [`SlowmodeEnforcer`].
pub struct SlowmodeEnforcerConfig {
    pub store: Arc<dyn LeaseStore>,
    pub locks: EventLockCoordinator,
    pub permissions: Arc<dyn PermissionProvider>,
    pub platform: Arc<dyn SlowmodePlatform>,
    pub alerts: Arc<dyn BotAlertSink>,
    pub clock: Arc<dyn Clock>,
    pub required_capabilities: CapabilitySet,
    pub expiry_timers_enabled: bool,
}

impl SlowmodeEnforcerConfig {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        permissions: Arc<dyn PermissionProvider>,
        platform: Arc<dyn SlowmodePlatform>,
    ) -> Self {
        Self {
            store,
            locks: EventLockCoordinator::new(),
            permissions,
            platform,
            alerts: Arc::new(TracingBotAlertSink),
            clock: Arc::new(SystemClock),
            required_capabilities: CapabilitySet::bot_slowmode_default(),
            expiry_timers_enabled: true,
        }
    }

    /// Applies the service knobs from `runtime` on top of [`Self::new`].
    pub fn from_runtime_config(
        runtime: &SlowmodeRuntimeConfig,
        store: Arc<dyn LeaseStore>,
        permissions: Arc<dyn PermissionProvider>,
        platform: Arc<dyn SlowmodePlatform>,
    ) -> Self {
        Self {
            locks: EventLockCoordinator::with_interrupt_retention(runtime.interrupt_retention()),
            required_capabilities: runtime.required_capabilities.clone(),
            expiry_timers_enabled: runtime.expiry_timers_enabled,
            ..Self::new(store, permissions, platform)
        }
    }
}

pub(crate) struct EnforcerInner {
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) cache: SlowmodeCache,
    pub(crate) locks: EventLockCoordinator,
    pub(crate) eligibility: EligibilityChecker,
    pub(crate) platform: Arc<dyn SlowmodePlatform>,
    pub(crate) alerts: Arc<dyn BotAlertSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) required_capabilities: CapabilitySet,
    pub(crate) timers: ExpiryTimerRegistry,
}

/// Bot slowmode engine. Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct SlowmodeEnforcer {
    pub(crate) inner: Arc<EnforcerInner>,
}

impl SlowmodeEnforcer {
    pub fn new(config: SlowmodeEnforcerConfig) -> Self {
        let cache = SlowmodeCache::new(Arc::clone(&config.store));
        Self {
            inner: Arc::new(EnforcerInner {
                store: config.store,
                cache,
                locks: config.locks,
                eligibility: EligibilityChecker::new(config.permissions),
                platform: config.platform,
                alerts: config.alerts,
                clock: config.clock,
                required_capabilities: config.required_capabilities,
                timers: ExpiryTimerRegistry::new(config.expiry_timers_enabled),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.inner.store
    }

    pub fn cache(&self) -> &SlowmodeCache {
        &self.inner.cache
    }

    pub fn locks(&self) -> &EventLockCoordinator {
        &self.inner.locks
    }

    pub fn now_unix_ms(&self) -> u64 {
        self.inner.clock.now_unix_ms()
    }

    pub fn pending_expiry_timers(&self) -> usize {
        self.inner.timers.pending_count()
    }

    pub(crate) fn subject_lock_key(channel_id: &str, user_id: &str) -> EventLockKey {
        EventLockKey::subject(SLOWMODE_SUBJECT_LOCK_SCOPE, channel_id, user_id)
    }

    /// Dispatcher entry point. Failures and panics are absorbed and logged.
    pub async fn on_inbound_event(&self, event: &SlowmodeInboundEvent) {
        let _ = self.handle_inbound_event(event).await;
    }

    /// Runs one event to its terminal state and reports it.
    #[tracing::instrument(
        name = "slowmode_event",
        skip_all,
        fields(
            channel_id = %event.channel_id,
            user_id = %event.author_id,
            message_id = %event.message_id
        )
    )]
    pub async fn handle_inbound_event(&self, event: &SlowmodeInboundEvent) -> SlowmodeOutcome {
        if event.author_is_bot {
            return SlowmodeOutcome::Ignored {
                reason_code: SLOWMODE_REASON_AUTHOR_IS_BOT,
            };
        }
        if !event.channel_kind.is_enforceable() {
            return SlowmodeOutcome::Ignored {
                reason_code: SLOWMODE_REASON_CHANNEL_KIND_UNSUPPORTED,
            };
        }

        let outcome = match AssertUnwindSafe(self.process_event(event))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("slowmode handler panicked; event abandoned");
                SlowmodeOutcome::Aborted {
                    reason_code: SLOWMODE_REASON_HANDLER_PANICKED,
                }
            }
        };
        tracing::debug!(reason_code = outcome.reason_code(), "slowmode event resolved");
        outcome
    }

    async fn process_event(&self, event: &SlowmodeInboundEvent) -> SlowmodeOutcome {
        let mut message_lock = self.inner.locks.acquire(event.message_lock_key()).await;
        let outcome = self.process_locked_event(event, &mut message_lock).await;
        message_lock.release();
        outcome
    }

    async fn process_locked_event(
        &self,
        event: &SlowmodeInboundEvent,
        message_lock: &mut EventLockHandle,
    ) -> SlowmodeOutcome {
        if message_lock.flow() == LockFlow::Interrupted {
            return SlowmodeOutcome::no_op(
                SlowmodeStage::Locked,
                SLOWMODE_REASON_MESSAGE_INTERRUPTED,
            );
        }

        let config = match self.inner.cache.get(&event.channel_id).await {
            Ok(Some(config)) if config.is_enforced() => config,
            Ok(Some(_)) => {
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::ConfigChecked,
                    SLOWMODE_REASON_CHANNEL_DISABLED,
                )
            }
            Ok(None) => {
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::ConfigChecked,
                    SLOWMODE_REASON_CHANNEL_NOT_CONFIGURED,
                )
            }
            Err(error) => {
                tracing::warn!(%error, "slowmode config lookup failed; treating channel as unconfigured");
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::ConfigChecked,
                    SLOWMODE_REASON_CONFIG_LOOKUP_FAILED,
                );
            }
        };

        let subject = event.subject_context();
        match self.inner.eligibility.is_affected(&subject, &config).await {
            Ok(true) => {}
            Ok(false) => {
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::EligibilityChecked,
                    SLOWMODE_REASON_SUBJECT_EXEMPT,
                )
            }
            Err(error) => {
                tracing::warn!(%error, "slowmode eligibility lookup failed");
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::EligibilityChecked,
                    SLOWMODE_REASON_ELIGIBILITY_LOOKUP_FAILED,
                );
            }
        }

        let missing = match self
            .inner
            .eligibility
            .missing_capabilities(&event.channel_id, &self.inner.required_capabilities)
            .await
        {
            Ok(missing) => missing,
            Err(error) => {
                tracing::warn!(%error, "slowmode capability lookup failed");
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::CapabilityChecked,
                    SLOWMODE_REASON_CAPABILITY_LOOKUP_FAILED,
                );
            }
        };
        if !missing.is_empty() {
            self.inner.alerts.log_bot_alert(BotAlert {
                channel_id: event.channel_id.clone(),
                reason_code: SLOWMODE_REASON_MISSING_CAPABILITIES.to_string(),
                body: format!(
                    "Unable to manage bot slowmode in <#{}>. {}",
                    event.channel_id,
                    missing.missing_permission_error()
                ),
            });
            return SlowmodeOutcome::no_op(
                SlowmodeStage::CapabilityChecked,
                SLOWMODE_REASON_MISSING_CAPABILITIES,
            );
        }

        let mut subject_lock = self
            .inner
            .locks
            .acquire(Self::subject_lock_key(&event.channel_id, &event.author_id))
            .await;
        let now_unix_ms = self.now_unix_ms();
        let active = match self
            .inner
            .store
            .active_lease(&event.channel_id, &event.author_id, now_unix_ms)
            .await
        {
            Ok(active) => active,
            Err(error) => {
                tracing::warn!(%error, "slowmode lease lookup failed");
                return SlowmodeOutcome::no_op(
                    SlowmodeStage::CapabilityChecked,
                    SLOWMODE_REASON_LEASE_LOOKUP_FAILED,
                );
            }
        };

        match active {
            Some(lease) => {
                subject_lock.release();
                self.suppress_message(event, lease, message_lock).await
            }
            None => {
                let applied = self
                    .apply_lease_locked(
                        &event.channel_id,
                        &event.author_id,
                        config.lease_duration(),
                        now_unix_ms,
                    )
                    .await;
                let outcome = match applied {
                    Ok(LeaseCreation::Created(lease)) => self.confirm_applied_lease(lease).await,
                    Ok(LeaseCreation::AlreadyActive(lease)) => {
                        tracing::debug!(
                            lease_id = %lease.lease_id,
                            "slowmode lease appeared concurrently; leaving it in place"
                        );
                        SlowmodeOutcome::no_op(
                            SlowmodeStage::CapabilityChecked,
                            SLOWMODE_REASON_LEASE_ALREADY_ACTIVE,
                        )
                    }
                    Err(error) => {
                        tracing::warn!(%error, "slowmode lease apply failed");
                        SlowmodeOutcome::LeaseApplyFailed {
                            error: error.to_string(),
                        }
                    }
                };
                subject_lock.release();
                outcome
            }
        }
    }

    /// Re-reads the channel config from the store after a lease went out.
    ///
    /// `disable_bot_slowmode` deletes the config before listing leases, so a
    /// lease created after that listing is caught here and lifted. Caller
    /// holds the subject lock for the lease's pair.
    async fn confirm_applied_lease(&self, lease: ActiveLease) -> SlowmodeOutcome {
        match self.inner.store.load_config(&lease.channel_id).await {
            Ok(Some(config)) if config.is_enforced() => SlowmodeOutcome::LeaseApplied { lease },
            Ok(_) => {
                let lifted = self.lift_and_purge_locked(&lease).await;
                if lifted.removed_record() {
                    self.inner.timers.cancel(&lease.lease_id);
                }
                tracing::info!(
                    lease_id = %lease.lease_id,
                    ?lifted,
                    "slowmode disabled while lease was applied; lease withdrawn"
                );
                SlowmodeOutcome::no_op(
                    SlowmodeStage::CapabilityChecked,
                    SLOWMODE_REASON_CHANNEL_DISABLED_CONCURRENTLY,
                )
            }
            Err(error) => {
                tracing::warn!(
                    lease_id = %lease.lease_id,
                    %error,
                    "slowmode config re-read failed; keeping applied lease"
                );
                SlowmodeOutcome::LeaseApplied { lease }
            }
        }
    }

    async fn suppress_message(
        &self,
        event: &SlowmodeInboundEvent,
        lease: ActiveLease,
        message_lock: &mut EventLockHandle,
    ) -> SlowmodeOutcome {
        match self
            .inner
            .platform
            .delete_message(&event.channel_id, &event.message_id)
            .await
        {
            Ok(()) => {
                message_lock.interrupt();
                tracing::info!(lease_id = %lease.lease_id, "slowmode message suppressed");
                SlowmodeOutcome::Suppressed {
                    lease_id: lease.lease_id,
                }
            }
            Err(error) => {
                tracing::warn!(
                    lease_id = %lease.lease_id,
                    %error,
                    "slowmode message suppression failed"
                );
                SlowmodeOutcome::SuppressionFailed {
                    lease_id: lease.lease_id,
                    error: error.to_string(),
                }
            }
        }
    }

    /// Opens a lease for `user_id` and restricts them in `channel_id`.
    ///
    /// Returns [`LeaseCreation::AlreadyActive`] without touching the platform
    /// when the pair is already restricted.
    pub async fn apply_lease(
        &self,
        channel_id: &str,
        user_id: &str,
        duration: Duration,
    ) -> Result<LeaseCreation, LeaseApplyError> {
        let _subject_lock = self
            .inner
            .locks
            .acquire(Self::subject_lock_key(channel_id, user_id))
            .await;
        let now_unix_ms = self.now_unix_ms();
        self.apply_lease_locked(channel_id, user_id, duration, now_unix_ms)
            .await
    }

    /// Caller holds the subject lock for the pair.
    async fn apply_lease_locked(
        &self,
        channel_id: &str,
        user_id: &str,
        duration: Duration,
        now_unix_ms: u64,
    ) -> Result<LeaseCreation, LeaseApplyError> {
        if duration.is_zero() {
            return Err(LeaseApplyError::InvalidDuration {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        let creation = self
            .inner
            .store
            .create_lease(NewLease {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                created_unix_ms: now_unix_ms,
                expires_unix_ms: unix_ms_after(now_unix_ms, duration),
            })
            .await?;
        let lease = match creation {
            LeaseCreation::Created(lease) => lease,
            already_active @ LeaseCreation::AlreadyActive(_) => return Ok(already_active),
        };

        if let Err(source) = self
            .inner
            .platform
            .apply_restriction(channel_id, user_id)
            .await
        {
            let rolled_back = match self.inner.store.delete_lease(&lease.lease_id).await {
                Ok(_) => true,
                Err(error) => {
                    tracing::error!(
                        lease_id = %lease.lease_id,
                        %error,
                        "failed to roll back slowmode lease after restriction failure"
                    );
                    false
                }
            };
            return Err(LeaseApplyError::Restriction {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                rolled_back,
                source,
            });
        }

        tracing::info!(
            lease_id = %lease.lease_id,
            channel_id,
            user_id,
            expires_unix_ms = lease.expires_unix_ms,
            "slowmode lease applied"
        );
        self.schedule_expiry(&lease);
        Ok(LeaseCreation::Created(lease))
    }
}

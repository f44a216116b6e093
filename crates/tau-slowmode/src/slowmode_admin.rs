//! Channel-level slowmode administration used by command handlers.

use serde::Serialize;

use crate::slowmode_enforcer::SlowmodeEnforcer;
use crate::slowmode_expiry::LiftOutcome;
use crate::slowmode_store::{LeaseStoreError, LeaseStoreResult, SlowmodeConfig};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SlowmodeDisableReport {
    pub channel_id: String,
    pub config_removed: bool,
    pub leases_lifted: usize,
    pub leases_failed: usize,
}

impl SlowmodeEnforcer {
    /// Stores the channel's config and drops the cached copy.
    pub async fn enable_bot_slowmode(
        &self,
        channel_id: &str,
        slowmode_seconds: u64,
        exempt_role_ids: Vec<String>,
    ) -> LeaseStoreResult<SlowmodeConfig> {
        if slowmode_seconds == 0 {
            return Err(LeaseStoreError::InvalidRequest(format!(
                "bot slowmode for '{channel_id}' needs a non-zero window"
            )));
        }
        let mut config =
            SlowmodeConfig::new(channel_id, slowmode_seconds).with_exempt_roles(exempt_role_ids);
        config.updated_unix_ms = self.now_unix_ms();
        self.inner.store.save_config(config.clone()).await?;
        self.inner.cache.invalidate(channel_id);
        tracing::info!(channel_id, slowmode_seconds, "bot slowmode enabled");
        Ok(config)
    }

    /// Lifts every restriction in the channel and removes its config.
    ///
    /// Leases whose lift failed stay stored so the sweeper retries them once
    /// they expire.
    pub async fn disable_bot_slowmode(
        &self,
        channel_id: &str,
    ) -> LeaseStoreResult<SlowmodeDisableReport> {
        let config_removed = self.inner.store.delete_config(channel_id).await?;
        self.inner.cache.invalidate(channel_id);

        let mut report = SlowmodeDisableReport {
            channel_id: channel_id.to_string(),
            config_removed,
            ..SlowmodeDisableReport::default()
        };
        for lease in self.inner.store.list_leases(Some(channel_id)).await? {
            match self.clear_user_slowmode(channel_id, &lease.user_id).await? {
                LiftOutcome::LiftFailed { .. } => report.leases_failed += 1,
                outcome if outcome.removed_record() => report.leases_lifted += 1,
                _ => {}
            }
        }
        tracing::info!(
            channel_id,
            lifted = report.leases_lifted,
            failed = report.leases_failed,
            "bot slowmode disabled"
        );
        Ok(report)
    }

    /// Manually lifts one user's restriction, expired or not.
    pub async fn clear_user_slowmode(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> LeaseStoreResult<LiftOutcome> {
        let _subject_lock = self
            .inner
            .locks
            .acquire(Self::subject_lock_key(channel_id, user_id))
            .await;
        let Some(lease) = self.inner.store.lease_record(channel_id, user_id).await? else {
            return Ok(LiftOutcome::Missing);
        };
        let outcome = self.lift_and_purge_locked(&lease).await;
        if outcome.removed_record() {
            self.inner.timers.cancel(&lease.lease_id);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use crate::slowmode_expiry::LiftOutcome;
    use crate::slowmode_test_support::SlowmodeHarness;
    use crate::{LeaseStoreError, SlowmodeOutcome};
    use std::time::Duration;

    #[tokio::test]
    async fn functional_enable_invalidates_cached_absence() {
        let harness = SlowmodeHarness::new();
        let before = harness
            .enforcer
            .handle_inbound_event(&harness.event("m-1", "c-1", "u-1"))
            .await;
        assert!(!before.enforced());
        assert_eq!(harness.enforcer.cache().peek("c-1"), Some(None));

        harness
            .enforcer
            .enable_bot_slowmode("c-1", 10, Vec::new())
            .await
            .expect("enable");
        let after = harness
            .enforcer
            .handle_inbound_event(&harness.event("m-2", "c-1", "u-1"))
            .await;
        assert!(matches!(after, SlowmodeOutcome::LeaseApplied { .. }));
    }

    #[tokio::test]
    async fn unit_enable_rejects_zero_window() {
        let harness = SlowmodeHarness::new();
        let error = harness
            .enforcer
            .enable_bot_slowmode("c-1", 0, Vec::new())
            .await
            .expect_err("zero window");
        assert!(matches!(error, LeaseStoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn functional_disable_lifts_channel_leases_only() {
        let harness = SlowmodeHarness::new();
        for channel in ["c-1", "c-2"] {
            harness
                .enforcer
                .enable_bot_slowmode(channel, 60, Vec::new())
                .await
                .expect("enable");
        }
        for (message, channel, user) in [("m-1", "c-1", "u-1"), ("m-2", "c-1", "u-2"), ("m-3", "c-2", "u-1")] {
            harness
                .enforcer
                .handle_inbound_event(&harness.event(message, channel, user))
                .await;
        }
        harness.platform.fail_lift_for("u-2");

        let report = harness
            .enforcer
            .disable_bot_slowmode("c-1")
            .await
            .expect("disable");
        assert!(report.config_removed);
        assert_eq!(report.leases_lifted, 1);
        assert_eq!(report.leases_failed, 1);
        assert!(!harness.platform.is_restricted("c-1", "u-1"));
        assert!(harness.platform.is_restricted("c-2", "u-1"));
        assert_eq!(harness.store.list_leases(Some("c-1")).await.expect("list").len(), 1);

        let outcome = harness
            .enforcer
            .handle_inbound_event(&harness.event("m-4", "c-1", "u-3"))
            .await;
        assert!(!outcome.enforced());
    }

    #[tokio::test]
    async fn regression_clear_and_disable_cancel_pending_expiry_timers() {
        let harness = SlowmodeHarness::with_system_clock_timers();
        for user in ["u-1", "u-2", "u-3"] {
            harness
                .enforcer
                .apply_lease("c-1", user, Duration::from_secs(60))
                .await
                .expect("apply");
        }
        assert_eq!(harness.enforcer.pending_expiry_timers(), 3);

        assert_eq!(
            harness
                .enforcer
                .clear_user_slowmode("c-1", "u-1")
                .await
                .expect("clear"),
            LiftOutcome::Lifted
        );
        assert_eq!(harness.enforcer.pending_expiry_timers(), 2);

        let report = harness
            .enforcer
            .disable_bot_slowmode("c-1")
            .await
            .expect("disable");
        assert_eq!(report.leases_lifted, 2);
        assert_eq!(harness.enforcer.pending_expiry_timers(), 0);
        assert!(!harness.platform.is_restricted("c-1", "u-2"));
    }

    #[tokio::test]
    async fn unit_clear_user_slowmode_reports_missing_pair() {
        let harness = SlowmodeHarness::new();
        assert_eq!(
            harness
                .enforcer
                .clear_user_slowmode("c-1", "u-1")
                .await
                .expect("clear"),
            LiftOutcome::Missing
        );
    }
}

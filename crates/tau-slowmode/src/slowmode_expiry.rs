//! Lifting restrictions once their lease ran out.
//!
//! Per-lease timers are best effort. The periodic sweep and startup recovery
//! catch whatever a timer missed, including leases left behind by a previous
//! process. Readers never depend on either: an expired record already counts
//! as absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::slowmode_config::SlowmodeRuntimeConfig;
use crate::slowmode_enforcer::{EnforcerInner, SlowmodeEnforcer};
use crate::slowmode_platform::SlowmodePlatformError;
use crate::slowmode_store::{ActiveLease, LeaseStoreResult};

pub const DEFAULT_SLOWMODE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pending expiry timers keyed by lease id.
pub(crate) struct ExpiryTimerRegistry {
    enabled: bool,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ExpiryTimerRegistry {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    fn track(&self, lease_id: String, task: JoinHandle<()>) {
        let mut timers = self.lock_timers();
        timers.retain(|_, timer| !timer.is_finished());
        if let Some(previous) = timers.insert(lease_id, task) {
            previous.abort();
        }
    }

    pub(crate) fn cancel(&self, lease_id: &str) -> bool {
        match self.lock_timers().remove(lease_id) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock_timers()
            .values()
            .filter(|timer| !timer.is_finished())
            .count()
    }
}

impl Drop for ExpiryTimerRegistry {
    fn drop(&mut self) {
        for (_, timer) in self.lock_timers().drain() {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of trying to lift one lease.
pub enum LiftOutcome {
    /// Restriction removed and record deleted.
    Lifted,
    /// The platform no longer knows the member or channel; record deleted.
    Purged,
    /// Nothing stored for the pair anymore.
    Missing,
    /// A newer lease replaced the one being lifted.
    Superseded,
    StillActive { remaining: Duration },
    /// Record kept for the next sweep.
    LiftFailed { error: String },
}

impl LiftOutcome {
    pub fn removed_record(&self) -> bool {
        matches!(self, Self::Lifted | Self::Purged)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SlowmodeSweepReport {
    pub scanned: usize,
    pub lifted: usize,
    pub purged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SlowmodeSweepReport {
    fn record(&mut self, outcome: &LiftOutcome) {
        match outcome {
            LiftOutcome::Lifted => self.lifted += 1,
            LiftOutcome::Purged => self.purged += 1,
            LiftOutcome::LiftFailed { .. } => self.failed += 1,
            LiftOutcome::Missing | LiftOutcome::Superseded | LiftOutcome::StillActive { .. } => {
                self.skipped += 1
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SlowmodeRecoveryReport {
    pub sweep: SlowmodeSweepReport,
    pub active_leases: usize,
    pub scheduled_timers: usize,
}

impl SlowmodeEnforcer {
    /// Starts a timer that lifts `lease` once it expires. No-op when timers
    /// are disabled or no tokio runtime is running.
    pub(crate) fn schedule_expiry(&self, lease: &ActiveLease) -> bool {
        if !self.inner.timers.enabled() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                lease_id = %lease.lease_id,
                "no tokio runtime; slowmode lease expiry left to the sweeper"
            );
            return false;
        };
        let delay = lease.remaining_at(self.now_unix_ms());
        let task = runtime.spawn(run_expiry_timer(
            Arc::downgrade(&self.inner),
            lease.clone(),
            delay,
        ));
        self.inner.timers.track(lease.lease_id.clone(), task);
        true
    }

    /// Lifts `lease` if it is still the stored record for its pair and expired.
    pub async fn lift_expired_lease(&self, lease: &ActiveLease) -> LiftOutcome {
        let _subject_lock = self
            .inner
            .locks
            .acquire(Self::subject_lock_key(&lease.channel_id, &lease.user_id))
            .await;
        let stored = match self
            .inner
            .store
            .lease_record(&lease.channel_id, &lease.user_id)
            .await
        {
            Ok(Some(stored)) => stored,
            Ok(None) => return LiftOutcome::Missing,
            Err(error) => {
                tracing::warn!(lease_id = %lease.lease_id, %error, "slowmode lease re-read failed");
                return LiftOutcome::LiftFailed {
                    error: error.to_string(),
                };
            }
        };
        if stored.lease_id != lease.lease_id {
            return LiftOutcome::Superseded;
        }
        let now_unix_ms = self.now_unix_ms();
        if stored.is_active_at(now_unix_ms) {
            return LiftOutcome::StillActive {
                remaining: stored.remaining_at(now_unix_ms),
            };
        }
        self.lift_and_purge_locked(&stored).await
    }

    /// Removes the restriction and the record regardless of expiry. Caller
    /// holds the subject lock for the lease's pair.
    pub(crate) async fn lift_and_purge_locked(&self, lease: &ActiveLease) -> LiftOutcome {
        let lifted = match self
            .inner
            .platform
            .lift_restriction(&lease.channel_id, &lease.user_id)
            .await
        {
            Ok(()) => LiftOutcome::Lifted,
            Err(SlowmodePlatformError::NotFound(detail)) => {
                tracing::info!(
                    lease_id = %lease.lease_id,
                    detail = %detail,
                    "slowmode restriction target gone; purging lease"
                );
                LiftOutcome::Purged
            }
            Err(error) => {
                tracing::warn!(
                    lease_id = %lease.lease_id,
                    channel_id = %lease.channel_id,
                    user_id = %lease.user_id,
                    %error,
                    "slowmode restriction lift failed; keeping lease for the next sweep"
                );
                return LiftOutcome::LiftFailed {
                    error: error.to_string(),
                };
            }
        };

        if let Err(error) = self.inner.store.delete_lease(&lease.lease_id).await {
            tracing::warn!(lease_id = %lease.lease_id, %error, "slowmode lease delete failed");
            return LiftOutcome::LiftFailed {
                error: error.to_string(),
            };
        }
        if lifted == LiftOutcome::Lifted {
            tracing::info!(
                lease_id = %lease.lease_id,
                channel_id = %lease.channel_id,
                user_id = %lease.user_id,
                "slowmode lease lifted"
            );
        }
        lifted
    }

    /// One sweep over every expired record in the store.
    pub async fn lift_expired_leases(&self) -> LeaseStoreResult<SlowmodeSweepReport> {
        let expired = self.inner.store.expired_leases(self.now_unix_ms()).await?;
        let mut report = SlowmodeSweepReport {
            scanned: expired.len(),
            ..SlowmodeSweepReport::default()
        };
        for lease in &expired {
            let outcome = self.lift_expired_lease(lease).await;
            if outcome.removed_record() {
                self.inner.timers.cancel(&lease.lease_id);
            }
            report.record(&outcome);
        }
        if report.scanned > 0 {
            tracing::debug!(
                scanned = report.scanned,
                lifted = report.lifted,
                purged = report.purged,
                failed = report.failed,
                "slowmode expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Startup pass: lift what expired while the process was down and arm
    /// timers for every lease still running.
    pub async fn recover_leases(&self) -> LeaseStoreResult<SlowmodeRecoveryReport> {
        let sweep = self.lift_expired_leases().await?;
        let now_unix_ms = self.now_unix_ms();
        let active = self
            .inner
            .store
            .list_leases(None)
            .await?
            .into_iter()
            .filter(|lease| lease.is_active_at(now_unix_ms))
            .collect::<Vec<_>>();
        let scheduled_timers = active
            .iter()
            .filter(|lease| self.schedule_expiry(lease))
            .count();
        tracing::info!(
            lifted = sweep.lifted + sweep.purged,
            active = active.len(),
            scheduled_timers,
            "slowmode leases recovered"
        );
        Ok(SlowmodeRecoveryReport {
            sweep,
            active_leases: active.len(),
            scheduled_timers,
        })
    }
}

async fn run_expiry_timer(inner: Weak<EnforcerInner>, lease: ActiveLease, delay: Duration) {
    let mut delay = delay;
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let enforcer = SlowmodeEnforcer { inner };
        match enforcer.lift_expired_lease(&lease).await {
            LiftOutcome::StillActive { remaining } => delay = remaining,
            _ => return,
        }
    }
}

#[derive(Debug)]
/// Running background sweeper.
pub struct SlowmodeSweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    completed_sweeps: Arc<AtomicU64>,
}

impl SlowmodeSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn completed_sweeps(&self) -> u64 {
        self.completed_sweeps.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn start_slowmode_expiry_sweeper(
    enforcer: SlowmodeEnforcer,
    interval: Duration,
) -> Result<SlowmodeSweeperHandle> {
    if interval.is_zero() {
        anyhow::bail!("slowmode sweep interval must be greater than zero");
    }
    let runtime = tokio::runtime::Handle::try_current()
        .context("slowmode expiry sweeper requires a running tokio runtime")?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let completed_sweeps = Arc::new(AtomicU64::new(0));
    let task = runtime.spawn(run_slowmode_sweep_loop(
        enforcer,
        interval,
        Arc::clone(&completed_sweeps),
        shutdown_rx,
    ));
    Ok(SlowmodeSweeperHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        completed_sweeps,
    })
}

/// What [`start_slowmode_expiry_service`] left running.
#[derive(Debug)]
pub struct SlowmodeExpiryService {
    pub recovery: SlowmodeRecoveryReport,
    pub sweeper: SlowmodeSweeperHandle,
}

/// Startup wiring for a host process: recover stored leases, then sweep at
/// the configured interval.
pub async fn start_slowmode_expiry_service(
    enforcer: &SlowmodeEnforcer,
    runtime: &SlowmodeRuntimeConfig,
) -> Result<SlowmodeExpiryService> {
    let recovery = enforcer
        .recover_leases()
        .await
        .context("failed to recover slowmode leases")?;
    let sweeper = start_slowmode_expiry_sweeper(enforcer.clone(), runtime.sweep_interval())?;
    Ok(SlowmodeExpiryService { recovery, sweeper })
}

async fn run_slowmode_sweep_loop(
    enforcer: SlowmodeEnforcer,
    period: Duration,
    completed_sweeps: Arc<AtomicU64>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(error) = enforcer.lift_expired_leases().await {
                    tracing::warn!(%error, "slowmode expiry sweep failed");
                }
                completed_sweeps.fetch_add(1, Ordering::SeqCst);
            }
            _ = &mut shutdown_rx => {
                tracing::debug!("slowmode expiry sweeper stopped");
                return;
            }
        }
    }
}

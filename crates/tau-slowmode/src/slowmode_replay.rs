//! Deterministic replay of recorded message traffic through the enforcer.
//!
//! A fixture declares channel configs, the bot's capabilities, injected
//! platform failures and an ordered list of messages. Replay drives a real
//! [`SlowmodeEnforcer`] with a manual clock and recording collaborators.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tau_core::{Clock, ManualClock};

use crate::slowmode_config::SlowmodeRuntimeConfig;
use crate::slowmode_contract::{validate_slowmode_inbound_event, SlowmodeInboundEvent};
use crate::slowmode_eligibility::{CapabilitySet, StaticPermissionProvider};
use crate::slowmode_enforcer::{SlowmodeEnforcer, SlowmodeEnforcerConfig, SlowmodeOutcome};
use crate::slowmode_expiry::SlowmodeSweepReport;
use crate::slowmode_platform::{
    BotAlert, RecordingBotAlertSink, RecordingSlowmodePlatform, SlowmodePlatformCall,
};
use crate::slowmode_store::{ActiveLease, LeaseStore, SlowmodeConfig};

pub const SLOWMODE_REPLAY_SCHEMA_VERSION: u32 = 1;

fn default_channel_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlowmodeReplayChannel {
    pub channel_id: String,
    pub slowmode_seconds: u64,
    #[serde(default = "default_channel_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub exempt_role_ids: Vec<String>,
    /// Bot capabilities in this channel; every capability when omitted.
    #[serde(default)]
    pub agent_capabilities: Option<CapabilitySet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlowmodeReplayFailures {
    #[serde(default)]
    pub delete_message_ids: Vec<String>,
    #[serde(default)]
    pub restriction_user_ids: Vec<String>,
    #[serde(default)]
    pub lift_user_ids: Vec<String>,
    #[serde(default)]
    pub departed_user_ids: Vec<String>,
    #[serde(default)]
    pub permission_channel_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlowmodeReplayEvent {
    #[serde(flatten)]
    pub event: SlowmodeInboundEvent,
    #[serde(default)]
    pub expected_reason_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlowmodeReplayFixture {
    pub schema_version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub channels: Vec<SlowmodeReplayChannel>,
    #[serde(default)]
    pub exempt_user_ids: Vec<String>,
    #[serde(default)]
    pub failures: SlowmodeReplayFailures,
    pub events: Vec<SlowmodeReplayEvent>,
    /// Clock value for one last expiry sweep after the final event.
    #[serde(default)]
    pub final_sweep_unix_ms: Option<u64>,
}

pub fn parse_slowmode_replay_fixture(raw: &str) -> Result<SlowmodeReplayFixture> {
    let fixture = serde_json::from_str::<SlowmodeReplayFixture>(raw)
        .context("failed to parse slowmode replay fixture")?;
    validate_slowmode_replay_fixture(&fixture)?;
    Ok(fixture)
}

pub fn load_slowmode_replay_fixture(path: &Path) -> Result<SlowmodeReplayFixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read slowmode replay fixture {}", path.display()))?;
    parse_slowmode_replay_fixture(&raw)
        .with_context(|| format!("invalid slowmode replay fixture {}", path.display()))
}

pub fn validate_slowmode_replay_fixture(fixture: &SlowmodeReplayFixture) -> Result<()> {
    if fixture.schema_version != SLOWMODE_REPLAY_SCHEMA_VERSION {
        bail!(
            "unsupported slowmode replay schema_version {} (expected {})",
            fixture.schema_version,
            SLOWMODE_REPLAY_SCHEMA_VERSION
        );
    }
    if fixture.name.trim().is_empty() {
        bail!("slowmode replay fixture name cannot be empty");
    }
    if fixture.events.is_empty() {
        bail!("slowmode replay fixture must include at least one event");
    }

    let mut channels = HashSet::new();
    for channel in &fixture.channels {
        if channel.channel_id.trim().is_empty() {
            bail!("slowmode replay channel_id cannot be empty");
        }
        if !channels.insert(channel.channel_id.as_str()) {
            bail!(
                "slowmode replay fixture configures channel '{}' twice",
                channel.channel_id
            );
        }
    }

    let mut messages = HashSet::new();
    let mut previous_timestamp = 0_u64;
    for (index, step) in fixture.events.iter().enumerate() {
        validate_slowmode_inbound_event(&step.event)
            .with_context(|| format!("fixture event index {index}"))?;
        let key = step.event.message_lock_key();
        if !messages.insert(key.clone()) {
            bail!("slowmode replay fixture contains duplicate message '{key}'");
        }
        if step.event.timestamp_ms < previous_timestamp {
            bail!(
                "fixture event index {index} goes back in time ({} < {previous_timestamp})",
                step.event.timestamp_ms
            );
        }
        previous_timestamp = step.event.timestamp_ms;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlowmodeReplayEventResult {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub timestamp_ms: u64,
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_reason_code: Option<String>,
    pub outcome: SlowmodeOutcome,
}

impl SlowmodeReplayEventResult {
    pub fn matches_expectation(&self) -> bool {
        self.expected_reason_code
            .as_deref()
            .map_or(true, |expected| expected == self.reason_code)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlowmodeReplayReport {
    pub schema_version: u32,
    pub fixture_name: String,
    pub events: Vec<SlowmodeReplayEventResult>,
    pub reason_code_counts: BTreeMap<String, usize>,
    pub platform_calls: Vec<SlowmodePlatformCall>,
    pub alerts: Vec<BotAlert>,
    pub sweep: SlowmodeSweepReport,
    pub remaining_leases: Vec<ActiveLease>,
}

impl SlowmodeReplayReport {
    /// Events whose outcome differs from the fixture's expectation.
    pub fn mismatches(&self) -> Vec<&SlowmodeReplayEventResult> {
        self.events
            .iter()
            .filter(|result| !result.matches_expectation())
            .collect()
    }

    pub fn count(&self, reason_code: &str) -> usize {
        self.reason_code_counts
            .get(reason_code)
            .copied()
            .unwrap_or(0)
    }
}

fn merge_sweep(total: &mut SlowmodeSweepReport, sweep: SlowmodeSweepReport) {
    total.scanned += sweep.scanned;
    total.lifted += sweep.lifted;
    total.purged += sweep.purged;
    total.skipped += sweep.skipped;
    total.failed += sweep.failed;
}

fn replay_permissions(fixture: &SlowmodeReplayFixture) -> StaticPermissionProvider {
    let mut permissions = StaticPermissionProvider::new();
    for channel in &fixture.channels {
        if let Some(capabilities) = &channel.agent_capabilities {
            permissions = permissions
                .with_channel_capabilities(channel.channel_id.clone(), capabilities.clone());
        }
    }
    for user_id in &fixture.exempt_user_ids {
        permissions = permissions.with_exempt_user(user_id.clone());
    }
    for channel_id in &fixture.failures.permission_channel_ids {
        permissions = permissions.with_failing_channel(channel_id.clone());
    }
    permissions
}

fn replay_platform(failures: &SlowmodeReplayFailures) -> RecordingSlowmodePlatform {
    let platform = RecordingSlowmodePlatform::new();
    for message_id in &failures.delete_message_ids {
        platform.fail_delete_for(message_id.clone());
    }
    for user_id in &failures.restriction_user_ids {
        platform.fail_restriction_for(user_id.clone());
    }
    for user_id in &failures.lift_user_ids {
        platform.fail_lift_for(user_id.clone());
    }
    for user_id in &failures.departed_user_ids {
        platform.remove_member(user_id.clone());
    }
    platform
}

/// Replays `fixture` against `store`. An expiry sweep runs before every event
/// once the clock reached the event's timestamp.
pub async fn run_slowmode_replay(
    fixture: &SlowmodeReplayFixture,
    store: Arc<dyn LeaseStore>,
    runtime: &SlowmodeRuntimeConfig,
) -> Result<SlowmodeReplayReport> {
    validate_slowmode_replay_fixture(fixture)?;

    let start_unix_ms = fixture
        .events
        .first()
        .map(|step| step.event.timestamp_ms)
        .unwrap_or(0);
    let clock = ManualClock::new(start_unix_ms);
    let platform = Arc::new(replay_platform(&fixture.failures));
    let alerts = Arc::new(RecordingBotAlertSink::new());
    let mut config = SlowmodeEnforcerConfig::from_runtime_config(
        runtime,
        Arc::clone(&store),
        Arc::new(replay_permissions(fixture)),
        platform.clone(),
    );
    config.alerts = alerts.clone();
    config.clock = Arc::new(clock.clone());
    // Replay time is simulated; expiry is driven by the sweeps below.
    config.expiry_timers_enabled = false;
    let enforcer = SlowmodeEnforcer::new(config);

    for channel in &fixture.channels {
        let mut config = SlowmodeConfig::new(channel.channel_id.clone(), channel.slowmode_seconds)
            .with_exempt_roles(channel.exempt_role_ids.clone());
        config.enabled = channel.enabled;
        config.updated_unix_ms = start_unix_ms;
        store
            .save_config(config)
            .await
            .with_context(|| format!("failed to store replay channel '{}'", channel.channel_id))?;
        enforcer.cache().invalidate(&channel.channel_id);
    }

    let mut sweep = SlowmodeSweepReport::default();
    let mut events = Vec::with_capacity(fixture.events.len());
    let mut reason_code_counts = BTreeMap::new();
    for step in &fixture.events {
        if step.event.timestamp_ms > clock.now_unix_ms() {
            clock.set(step.event.timestamp_ms);
        }
        merge_sweep(&mut sweep, enforcer.lift_expired_leases().await?);

        let outcome = enforcer.handle_inbound_event(&step.event).await;
        let reason_code = outcome.reason_code().to_string();
        *reason_code_counts.entry(reason_code.clone()).or_insert(0) += 1;
        events.push(SlowmodeReplayEventResult {
            message_id: step.event.message_id.clone(),
            channel_id: step.event.channel_id.clone(),
            author_id: step.event.author_id.clone(),
            timestamp_ms: step.event.timestamp_ms,
            reason_code,
            expected_reason_code: step.expected_reason_code.clone(),
            outcome,
        });
    }

    if let Some(final_sweep_unix_ms) = fixture.final_sweep_unix_ms {
        if final_sweep_unix_ms > clock.now_unix_ms() {
            clock.set(final_sweep_unix_ms);
        }
        merge_sweep(&mut sweep, enforcer.lift_expired_leases().await?);
    }

    let now_unix_ms = clock.now_unix_ms();
    let remaining_leases = store
        .list_leases(None)
        .await?
        .into_iter()
        .filter(|lease| lease.is_active_at(now_unix_ms))
        .collect();

    Ok(SlowmodeReplayReport {
        schema_version: SLOWMODE_REPLAY_SCHEMA_VERSION,
        fixture_name: fixture.name.clone(),
        events,
        reason_code_counts,
        platform_calls: platform.calls(),
        alerts: alerts.alerts(),
        sweep,
        remaining_leases,
    })
}

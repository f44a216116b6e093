//! Outbound actions against the chat platform and the operator alert sink.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlowmodePlatformError {
    /// Message, member or channel no longer exists.
    #[error("platform resource not found: {0}")]
    NotFound(String),
    #[error("missing platform permissions: {0}")]
    MissingPermissions(String),
    #[error("platform rejected request: {0}")]
    Rejected(String),
    #[error("platform transport error: {0}")]
    Transport(String),
}

impl SlowmodePlatformError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "platform_not_found",
            Self::MissingPermissions(_) => "platform_missing_permissions",
            Self::Rejected(_) => "platform_rejected",
            Self::Transport(_) => "platform_transport",
        }
    }
}

/// Platform calls the enforcer issues. Implementations wrap the bot client.
#[async_trait]
pub trait SlowmodePlatform: Send + Sync {
    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), SlowmodePlatformError>;

    /// Denies the user the right to post in the channel.
    async fn apply_restriction(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<(), SlowmodePlatformError>;

    async fn lift_restriction(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<(), SlowmodePlatformError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SlowmodePlatformAction {
    DeleteMessage { channel_id: String, message_id: String },
    ApplyRestriction { channel_id: String, user_id: String },
    LiftRestriction { channel_id: String, user_id: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlowmodePlatformCall {
    #[serde(flatten)]
    pub action: SlowmodePlatformAction,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<SlowmodePlatformCall>,
    restricted: HashSet<(String, String)>,
    failing_deletes: HashSet<String>,
    failing_restrictions: HashSet<String>,
    failing_lifts: HashSet<String>,
    missing_members: HashSet<String>,
}

/// In-process platform that records every call. Failures are injected per
/// message id (deletes) or per user id (restrictions).
#[derive(Debug, Default)]
pub struct RecordingSlowmodePlatform {
    state: Mutex<RecordingState>,
}

impl RecordingSlowmodePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_delete_for(&self, message_id: impl Into<String>) {
        self.lock_state().failing_deletes.insert(message_id.into());
    }

    pub fn fail_restriction_for(&self, user_id: impl Into<String>) {
        self.lock_state()
            .failing_restrictions
            .insert(user_id.into());
    }

    pub fn fail_lift_for(&self, user_id: impl Into<String>) {
        self.lock_state().failing_lifts.insert(user_id.into());
    }

    /// Lifts for this user report `NotFound`, as if they left the server.
    pub fn remove_member(&self, user_id: impl Into<String>) {
        self.lock_state().missing_members.insert(user_id.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock_state();
        state.failing_deletes.clear();
        state.failing_restrictions.clear();
        state.failing_lifts.clear();
        state.missing_members.clear();
    }

    pub fn calls(&self) -> Vec<SlowmodePlatformCall> {
        self.lock_state().calls.clone()
    }

    fn count_attempts(&self, matches: impl Fn(&SlowmodePlatformAction) -> bool) -> usize {
        self.lock_state()
            .calls
            .iter()
            .filter(|call| matches(&call.action))
            .count()
    }

    pub fn delete_attempts(&self) -> usize {
        self.count_attempts(|action| matches!(action, SlowmodePlatformAction::DeleteMessage { .. }))
    }

    pub fn restriction_attempts(&self) -> usize {
        self.count_attempts(|action| {
            matches!(action, SlowmodePlatformAction::ApplyRestriction { .. })
        })
    }

    pub fn lift_attempts(&self) -> usize {
        self.count_attempts(|action| {
            matches!(action, SlowmodePlatformAction::LiftRestriction { .. })
        })
    }

    pub fn is_restricted(&self, channel_id: &str, user_id: &str) -> bool {
        self.lock_state()
            .restricted
            .contains(&(channel_id.to_string(), user_id.to_string()))
    }
}

#[async_trait]
impl SlowmodePlatform for RecordingSlowmodePlatform {
    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), SlowmodePlatformError> {
        let mut state = self.lock_state();
        let failed = state.failing_deletes.contains(message_id);
        state.calls.push(SlowmodePlatformCall {
            action: SlowmodePlatformAction::DeleteMessage {
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
            },
            succeeded: !failed,
        });
        if failed {
            return Err(SlowmodePlatformError::Rejected(format!(
                "delete of message '{message_id}' rejected"
            )));
        }
        Ok(())
    }

    async fn apply_restriction(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<(), SlowmodePlatformError> {
        let mut state = self.lock_state();
        let failed = state.failing_restrictions.contains(user_id);
        state.calls.push(SlowmodePlatformCall {
            action: SlowmodePlatformAction::ApplyRestriction {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
            },
            succeeded: !failed,
        });
        if failed {
            return Err(SlowmodePlatformError::MissingPermissions(format!(
                "cannot edit overrides for '{user_id}' in '{channel_id}'"
            )));
        }
        state
            .restricted
            .insert((channel_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn lift_restriction(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<(), SlowmodePlatformError> {
        let mut state = self.lock_state();
        let result = if state.missing_members.contains(user_id) {
            Err(SlowmodePlatformError::NotFound(format!(
                "member '{user_id}' not found"
            )))
        } else if state.failing_lifts.contains(user_id) {
            Err(SlowmodePlatformError::Transport(
                "gateway timeout".to_string(),
            ))
        } else {
            Ok(())
        };
        state.calls.push(SlowmodePlatformCall {
            action: SlowmodePlatformAction::LiftRestriction {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
            },
            succeeded: result.is_ok(),
        });
        if result.is_ok() {
            state
                .restricted
                .remove(&(channel_id.to_string(), user_id.to_string()));
        }
        result
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BotAlert {
    pub channel_id: String,
    pub reason_code: String,
    pub body: String,
}

/// Operator-facing notification channel. Delivery is fire-and-forget.
pub trait BotAlertSink: Send + Sync {
    fn log_bot_alert(&self, alert: BotAlert);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBotAlertSink;

impl BotAlertSink for TracingBotAlertSink {
    fn log_bot_alert(&self, alert: BotAlert) {
        tracing::warn!(
            target: "tau_slowmode::bot_alert",
            channel_id = %alert.channel_id,
            reason_code = %alert.reason_code,
            "{}",
            alert.body
        );
    }
}

#[derive(Debug, Default)]
pub struct RecordingBotAlertSink {
    alerts: Mutex<Vec<BotAlert>>,
}

impl RecordingBotAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<BotAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BotAlertSink for RecordingBotAlertSink {
    fn log_bot_alert(&self, alert: BotAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}

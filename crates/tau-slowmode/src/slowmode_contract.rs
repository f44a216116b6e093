//! Inbound message contract consumed by the slowmode enforcer.
//!
//! Dispatch wiring converts platform message events into
//! [`SlowmodeInboundEvent`] values. Parsing helpers validate the JSON form used
//! by replay fixtures and the fuzz target.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tau_event_locks::EventLockKey;

use crate::slowmode_eligibility::SubjectContext;

pub const SLOWMODE_EVENT_SCHEMA_VERSION: u32 = 1;

fn slowmode_event_schema_version() -> u32 {
    SLOWMODE_EVENT_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
/// Kind of channel a message was posted in.
pub enum SlowmodeChannelKind {
    #[default]
    Text,
    Announcement,
    Thread,
    Voice,
    StageVoice,
    Forum,
    Other,
}

impl SlowmodeChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Announcement => "announcement",
            Self::Thread => "thread",
            Self::Voice => "voice",
            Self::StageVoice => "stage_voice",
            Self::Forum => "forum",
            Self::Other => "other",
        }
    }

    /// Text-capable channels, excluding stage channels.
    pub fn is_enforceable(self) -> bool {
        matches!(
            self,
            Self::Text | Self::Announcement | Self::Thread | Self::Voice
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// A message created in a guild channel.
pub struct SlowmodeInboundEvent {
    #[serde(default = "slowmode_event_schema_version")]
    pub schema_version: u32,
    pub message_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_kind: SlowmodeChannelKind,
    pub author_id: String,
    #[serde(default)]
    pub author_is_bot: bool,
    #[serde(default)]
    pub author_role_ids: Vec<String>,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub content: String,
}

impl SlowmodeInboundEvent {
    pub fn new(
        message_id: impl Into<String>,
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: SLOWMODE_EVENT_SCHEMA_VERSION,
            message_id: message_id.into(),
            channel_id: channel_id.into(),
            channel_kind: SlowmodeChannelKind::Text,
            author_id: author_id.into(),
            author_is_bot: false,
            author_role_ids: Vec::new(),
            timestamp_ms: 0,
            content: String::new(),
        }
    }

    /// Lock shared by every stage that handles this message.
    pub fn message_lock_key(&self) -> EventLockKey {
        EventLockKey::message(&self.channel_id, &self.message_id)
    }

    pub fn subject_context(&self) -> SubjectContext {
        SubjectContext {
            channel_id: self.channel_id.clone(),
            user_id: self.author_id.clone(),
            role_ids: self.author_role_ids.clone(),
        }
    }
}

pub fn parse_slowmode_inbound_event(raw: &str) -> Result<SlowmodeInboundEvent> {
    let event = serde_json::from_str::<SlowmodeInboundEvent>(raw)
        .context("failed to parse slowmode inbound event")?;
    validate_slowmode_inbound_event(&event)?;
    Ok(event)
}

pub fn validate_slowmode_inbound_event(event: &SlowmodeInboundEvent) -> Result<()> {
    if event.schema_version != SLOWMODE_EVENT_SCHEMA_VERSION {
        bail!(
            "unsupported slowmode event schema_version {} (expected {})",
            event.schema_version,
            SLOWMODE_EVENT_SCHEMA_VERSION
        );
    }
    if event.message_id.trim().is_empty() {
        bail!("slowmode event message_id cannot be empty");
    }
    if event.channel_id.trim().is_empty() {
        bail!(
            "slowmode event '{}' has an empty channel_id",
            event.message_id
        );
    }
    if event.author_id.trim().is_empty() {
        bail!("slowmode event '{}' has an empty author_id", event.message_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_slowmode_inbound_event, SlowmodeChannelKind};

    #[test]
    fn unit_parse_slowmode_inbound_event_applies_defaults() {
        let event = parse_slowmode_inbound_event(
            r#"{"message_id":"m-1","channel_id":"c-1","author_id":"u-1"}"#,
        )
        .expect("parse event");
        assert_eq!(event.channel_kind, SlowmodeChannelKind::Text);
        assert!(!event.author_is_bot);
        assert_eq!(event.message_lock_key().as_str(), "message:c-1:m-1");
    }

    #[test]
    fn unit_parse_slowmode_inbound_event_rejects_blank_author() {
        let error = parse_slowmode_inbound_event(
            r#"{"message_id":"m-1","channel_id":"c-1","author_id":"  "}"#,
        )
        .expect_err("blank author must fail");
        assert!(error.to_string().contains("empty author_id"));
    }

    #[test]
    fn unit_stage_channels_are_not_enforceable() {
        assert!(SlowmodeChannelKind::Thread.is_enforceable());
        assert!(SlowmodeChannelKind::Voice.is_enforceable());
        assert!(!SlowmodeChannelKind::StageVoice.is_enforceable());
        assert!(!SlowmodeChannelKind::Forum.is_enforceable());
    }
}

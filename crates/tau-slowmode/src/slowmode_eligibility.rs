//! Capability and exemption pre-flight checks for slowmode enforcement.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slowmode_store::SlowmodeConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
/// Channel-level right the bot may or may not hold.
pub enum Capability {
    ViewChannel,
    SendMessages,
    ReadMessageHistory,
    ManageMessages,
    ManageRoles,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewChannel => "view_channel",
            Self::SendMessages => "send_messages",
            Self::ReadMessageHistory => "read_message_history",
            Self::ManageMessages => "manage_messages",
            Self::ManageRoles => "manage_roles",
        }
    }

    /// Name shown to server operators in alerts.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::ViewChannel => "View Channel",
            Self::SendMessages => "Send Messages",
            Self::ReadMessageHistory => "Read Message History",
            Self::ManageMessages => "Manage Messages",
            Self::ManageRoles => "Manage Roles",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rights needed to delete messages and maintain the per-user channel override.
pub const BOT_SLOWMODE_CAPABILITIES: [Capability; 3] = [
    Capability::ViewChannel,
    Capability::ManageMessages,
    Capability::ManageRoles,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bot_slowmode_default() -> Self {
        BOT_SLOWMODE_CAPABILITIES.into_iter().collect()
    }

    pub fn all() -> Self {
        [
            Capability::ViewChannel,
            Capability::SendMessages,
            Capability::ReadMessageHistory,
            Capability::ManageMessages,
            Capability::ManageRoles,
        ]
        .into_iter()
        .collect()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Entries of `self` (the required set) absent from `granted`.
    pub fn missing_from(&self, granted: &CapabilitySet) -> MissingCapabilities {
        MissingCapabilities(self.0.difference(&granted.0).copied().collect())
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Required capabilities the bot lacks. Empty means enforcement may proceed.
pub struct MissingCapabilities(BTreeSet<Capability>);

impl MissingCapabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn as_codes(&self) -> Vec<&'static str> {
        self.iter().map(Capability::as_str).collect()
    }

    /// `Missing permissions: **Manage Messages**, **Manage Roles**`
    pub fn missing_permission_error(&self) -> String {
        let names = self
            .iter()
            .map(|capability| format!("**{}**", capability.display_name()))
            .collect::<Vec<_>>();
        format!("Missing permissions: {}", names.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The author of an inbound message, seen from one channel.
pub struct SubjectContext {
    pub channel_id: String,
    pub user_id: String,
    pub role_ids: Vec<String>,
}

impl SubjectContext {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            role_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PermissionLookupError {
    #[error("permission data unavailable for channel '{channel_id}': {reason}")]
    Unavailable { channel_id: String, reason: String },
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
}

/// Live permission data from the chat platform.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// False when the subject holds a platform-level exemption (for example
    /// the bypass-slowmode right or channel management).
    async fn is_affected(&self, subject: &SubjectContext) -> Result<bool, PermissionLookupError>;

    async fn agent_capabilities(
        &self,
        channel_id: &str,
    ) -> Result<CapabilitySet, PermissionLookupError>;
}

/// Fixed permission table used by tests and fixture replay.
#[derive(Debug, Clone)]
pub struct StaticPermissionProvider {
    default_capabilities: CapabilitySet,
    channel_capabilities: HashMap<String, CapabilitySet>,
    exempt_users: HashSet<String>,
    failing_channels: HashSet<String>,
}

impl Default for StaticPermissionProvider {
    fn default() -> Self {
        Self {
            default_capabilities: CapabilitySet::all(),
            channel_capabilities: HashMap::new(),
            exempt_users: HashSet::new(),
            failing_channels: HashSet::new(),
        }
    }
}

impl StaticPermissionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.default_capabilities = capabilities;
        self
    }

    pub fn with_channel_capabilities(
        mut self,
        channel_id: impl Into<String>,
        capabilities: CapabilitySet,
    ) -> Self {
        self.channel_capabilities
            .insert(channel_id.into(), capabilities);
        self
    }

    pub fn with_exempt_user(mut self, user_id: impl Into<String>) -> Self {
        self.exempt_users.insert(user_id.into());
        self
    }

    /// Every lookup touching `channel_id` fails.
    pub fn with_failing_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.failing_channels.insert(channel_id.into());
        self
    }

    fn check_channel(&self, channel_id: &str) -> Result<(), PermissionLookupError> {
        if self.failing_channels.contains(channel_id) {
            return Err(PermissionLookupError::Unavailable {
                channel_id: channel_id.to_string(),
                reason: "injected permission lookup failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissionProvider {
    async fn is_affected(&self, subject: &SubjectContext) -> Result<bool, PermissionLookupError> {
        self.check_channel(&subject.channel_id)?;
        Ok(!self.exempt_users.contains(&subject.user_id))
    }

    async fn agent_capabilities(
        &self,
        channel_id: &str,
    ) -> Result<CapabilitySet, PermissionLookupError> {
        self.check_channel(channel_id)?;
        Ok(self
            .channel_capabilities
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| self.default_capabilities.clone()))
    }
}

/// Combines config-level exemptions with the platform's permission view.
#[derive(Clone)]
pub struct EligibilityChecker {
    permissions: Arc<dyn PermissionProvider>,
}

impl EligibilityChecker {
    pub fn new(permissions: Arc<dyn PermissionProvider>) -> Self {
        Self { permissions }
    }

    pub async fn is_affected(
        &self,
        subject: &SubjectContext,
        config: &SlowmodeConfig,
    ) -> Result<bool, PermissionLookupError> {
        let exempt_by_role = subject
            .role_ids
            .iter()
            .any(|role| config.exempt_role_ids.contains(role));
        if exempt_by_role {
            return Ok(false);
        }
        self.permissions.is_affected(subject).await
    }

    pub async fn missing_capabilities(
        &self,
        channel_id: &str,
        required: &CapabilitySet,
    ) -> Result<MissingCapabilities, PermissionLookupError> {
        let granted = self.permissions.agent_capabilities(channel_id).await?;
        Ok(required.missing_from(&granted))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Capability, CapabilitySet, EligibilityChecker, PermissionLookupError,
        StaticPermissionProvider, SubjectContext,
    };
    use crate::SlowmodeConfig;
    use std::sync::Arc;

    #[test]
    fn unit_missing_permission_error_lists_display_names_in_order() {
        let granted = [Capability::ViewChannel].into_iter().collect::<CapabilitySet>();
        let missing = CapabilitySet::bot_slowmode_default().missing_from(&granted);
        assert_eq!(
            missing.missing_permission_error(),
            "Missing permissions: **Manage Messages**, **Manage Roles**"
        );
        assert_eq!(missing.as_codes(), vec!["manage_messages", "manage_roles"]);
    }

    #[test]
    fn unit_capability_set_serializes_as_snake_case_list() {
        let set = CapabilitySet::bot_slowmode_default();
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, r#"["view_channel","manage_messages","manage_roles"]"#);
        let parsed: CapabilitySet = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, set);
    }

    #[tokio::test]
    async fn functional_exempt_role_skips_provider_lookup() {
        let provider = StaticPermissionProvider::new().with_failing_channel("c-1");
        let checker = EligibilityChecker::new(Arc::new(provider));
        let config = SlowmodeConfig::new("c-1", 10).with_exempt_roles(vec!["mods".to_string()]);

        let mut subject = SubjectContext::new("c-1", "u-1");
        subject.role_ids.push("mods".to_string());
        assert!(!checker.is_affected(&subject, &config).await.expect("exempt"));

        subject.role_ids.clear();
        let error = checker
            .is_affected(&subject, &config)
            .await
            .expect_err("provider failure surfaces");
        assert!(matches!(error, PermissionLookupError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn functional_channel_override_reports_missing_capabilities() {
        let provider = StaticPermissionProvider::new().with_channel_capabilities(
            "c-2",
            [Capability::ViewChannel, Capability::ManageMessages]
                .into_iter()
                .collect(),
        );
        let checker = EligibilityChecker::new(Arc::new(provider));
        let required = CapabilitySet::bot_slowmode_default();

        assert!(checker
            .missing_capabilities("c-1", &required)
            .await
            .expect("default caps")
            .is_empty());
        let missing = checker
            .missing_capabilities("c-2", &required)
            .await
            .expect("override caps");
        assert!(missing.contains(Capability::ManageRoles));
        assert!(!missing.contains(Capability::ManageMessages));
    }
}

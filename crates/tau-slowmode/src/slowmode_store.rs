//! Durable slowmode state: per-channel configuration and per-subject leases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tau_core::{current_unix_timestamp_ms, is_expired_unix_ms};
use thiserror::Error;
use tokio::sync::RwLock;

/// Result type for lease store operations.
pub type LeaseStoreResult<T> = Result<T, LeaseStoreError>;

/// Errors returned by lease store implementations.
#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid lease store request: {0}")]
    InvalidRequest(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn default_slowmode_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Bot-maintained slowmode settings for one channel.
pub struct SlowmodeConfig {
    pub channel_id: String,
    pub slowmode_seconds: u64,
    #[serde(default = "default_slowmode_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub exempt_role_ids: Vec<String>,
    #[serde(default)]
    pub updated_unix_ms: u64,
}

impl SlowmodeConfig {
    pub fn new(channel_id: impl Into<String>, slowmode_seconds: u64) -> Self {
        Self {
            channel_id: channel_id.into(),
            slowmode_seconds,
            enabled: true,
            exempt_role_ids: Vec::new(),
            updated_unix_ms: 0,
        }
    }

    pub fn with_exempt_roles(mut self, role_ids: Vec<String>) -> Self {
        self.exempt_role_ids = role_ids;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.slowmode_seconds)
    }

    /// A stored config only restricts anyone while enabled with a non-zero window.
    pub fn is_enforced(&self) -> bool {
        self.enabled && self.slowmode_seconds > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Restriction record for one (channel, user) pair.
pub struct ActiveLease {
    pub lease_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub created_unix_ms: u64,
    pub expires_unix_ms: u64,
}

impl ActiveLease {
    /// Expired records count as absent even before anything purges them.
    pub fn is_active_at(&self, now_unix_ms: u64) -> bool {
        !is_expired_unix_ms(self.expires_unix_ms, now_unix_ms)
    }

    pub fn remaining_at(&self, now_unix_ms: u64) -> Duration {
        Duration::from_millis(self.expires_unix_ms.saturating_sub(now_unix_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Request to open a lease.
pub struct NewLease {
    pub channel_id: String,
    pub user_id: String,
    pub created_unix_ms: u64,
    pub expires_unix_ms: u64,
}

impl NewLease {
    pub(crate) fn validate(&self) -> LeaseStoreResult<()> {
        if self.channel_id.trim().is_empty() || self.user_id.trim().is_empty() {
            return Err(LeaseStoreError::InvalidRequest(
                "lease channel_id and user_id cannot be empty".to_string(),
            ));
        }
        if self.expires_unix_ms <= self.created_unix_ms {
            return Err(LeaseStoreError::InvalidRequest(format!(
                "lease for '{}' in '{}' expires at {} which is not after {}",
                self.user_id, self.channel_id, self.expires_unix_ms, self.created_unix_ms
            )));
        }
        Ok(())
    }

    fn into_lease(self) -> ActiveLease {
        ActiveLease {
            lease_id: next_lease_id(),
            channel_id: self.channel_id,
            user_id: self.user_id,
            created_unix_ms: self.created_unix_ms,
            expires_unix_ms: self.expires_unix_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of [`LeaseStore::create_lease`].
pub enum LeaseCreation {
    Created(ActiveLease),
    AlreadyActive(ActiveLease),
}

impl LeaseCreation {
    pub fn lease(&self) -> &ActiveLease {
        match self {
            Self::Created(lease) | Self::AlreadyActive(lease) => lease,
        }
    }

    pub fn into_lease(self) -> ActiveLease {
        match self {
            Self::Created(lease) | Self::AlreadyActive(lease) => lease,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Async store contract used by the enforcer, the expiry sweeper and channel
/// administration.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn load_config(&self, channel_id: &str) -> LeaseStoreResult<Option<SlowmodeConfig>>;
    async fn save_config(&self, config: SlowmodeConfig) -> LeaseStoreResult<()>;
    async fn delete_config(&self, channel_id: &str) -> LeaseStoreResult<bool>;
    async fn list_configs(&self) -> LeaseStoreResult<Vec<SlowmodeConfig>>;

    /// Stored record for the pair, whether or not it already expired.
    async fn lease_record(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> LeaseStoreResult<Option<ActiveLease>>;

    async fn active_lease(
        &self,
        channel_id: &str,
        user_id: &str,
        now_unix_ms: u64,
    ) -> LeaseStoreResult<Option<ActiveLease>> {
        Ok(self
            .lease_record(channel_id, user_id)
            .await?
            .filter(|lease| lease.is_active_at(now_unix_ms)))
    }

    async fn has_active_lease(
        &self,
        channel_id: &str,
        user_id: &str,
        now_unix_ms: u64,
    ) -> LeaseStoreResult<bool> {
        Ok(self
            .active_lease(channel_id, user_id, now_unix_ms)
            .await?
            .is_some())
    }

    /// Opens a lease. A record still active at `created_unix_ms` is returned
    /// untouched as [`LeaseCreation::AlreadyActive`]; an expired one is replaced.
    async fn create_lease(&self, request: NewLease) -> LeaseStoreResult<LeaseCreation>;

    async fn delete_lease(&self, lease_id: &str) -> LeaseStoreResult<bool>;
    async fn list_leases(&self, channel_id: Option<&str>) -> LeaseStoreResult<Vec<ActiveLease>>;
    async fn expired_leases(&self, now_unix_ms: u64) -> LeaseStoreResult<Vec<ActiveLease>>;
}

pub(crate) fn next_lease_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let value = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("lease-{}-{value}", current_unix_timestamp_ms())
}

fn sort_leases(leases: &mut [ActiveLease]) {
    leases.sort_by(|left, right| {
        (left.channel_id.as_str(), left.user_id.as_str())
            .cmp(&(right.channel_id.as_str(), right.user_id.as_str()))
    });
}

/// In-memory implementation for tests and fixture replay.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    inner: RwLock<InMemoryLeaseState>,
}

#[derive(Debug, Default)]
struct InMemoryLeaseState {
    configs: HashMap<String, SlowmodeConfig>,
    leases: HashMap<(String, String), ActiveLease>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn load_config(&self, channel_id: &str) -> LeaseStoreResult<Option<SlowmodeConfig>> {
        let inner = self.inner.read().await;
        Ok(inner.configs.get(channel_id).cloned())
    }

    async fn save_config(&self, config: SlowmodeConfig) -> LeaseStoreResult<()> {
        if config.channel_id.trim().is_empty() {
            return Err(LeaseStoreError::InvalidRequest(
                "slowmode config channel_id cannot be empty".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;
        inner.configs.insert(config.channel_id.clone(), config);
        Ok(())
    }

    async fn delete_config(&self, channel_id: &str) -> LeaseStoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.configs.remove(channel_id).is_some())
    }

    async fn list_configs(&self) -> LeaseStoreResult<Vec<SlowmodeConfig>> {
        let inner = self.inner.read().await;
        let mut configs = inner.configs.values().cloned().collect::<Vec<_>>();
        configs.sort_by(|left, right| left.channel_id.cmp(&right.channel_id));
        Ok(configs)
    }

    async fn lease_record(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> LeaseStoreResult<Option<ActiveLease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .leases
            .get(&(channel_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn create_lease(&self, request: NewLease) -> LeaseStoreResult<LeaseCreation> {
        request.validate()?;
        let mut inner = self.inner.write().await;
        let pair = (request.channel_id.clone(), request.user_id.clone());
        if let Some(existing) = inner.leases.get(&pair) {
            if existing.is_active_at(request.created_unix_ms) {
                return Ok(LeaseCreation::AlreadyActive(existing.clone()));
            }
        }

        let lease = request.into_lease();
        inner.leases.insert(pair, lease.clone());
        Ok(LeaseCreation::Created(lease))
    }

    async fn delete_lease(&self, lease_id: &str) -> LeaseStoreResult<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.leases.len();
        inner.leases.retain(|_, lease| lease.lease_id != lease_id);
        Ok(inner.leases.len() != before)
    }

    async fn list_leases(&self, channel_id: Option<&str>) -> LeaseStoreResult<Vec<ActiveLease>> {
        let inner = self.inner.read().await;
        let mut leases = inner
            .leases
            .values()
            .filter(|lease| channel_id.map_or(true, |channel| lease.channel_id == channel))
            .cloned()
            .collect::<Vec<_>>();
        sort_leases(&mut leases);
        Ok(leases)
    }

    async fn expired_leases(&self, now_unix_ms: u64) -> LeaseStoreResult<Vec<ActiveLease>> {
        let inner = self.inner.read().await;
        let mut leases = inner
            .leases
            .values()
            .filter(|lease| !lease.is_active_at(now_unix_ms))
            .cloned()
            .collect::<Vec<_>>();
        sort_leases(&mut leases);
        Ok(leases)
    }
}

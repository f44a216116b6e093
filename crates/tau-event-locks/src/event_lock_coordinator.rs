use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// How long an interrupted key keeps reporting `Interrupted` to late stages
/// after its last holder released it.
pub const DEFAULT_INTERRUPT_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Deterministic identifier shared by every stage handling the same event.
pub struct EventLockKey(String);

impl EventLockKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key for cross-stage handling of a single inbound message.
    pub fn message(channel_id: &str, message_id: &str) -> Self {
        Self(format!("message:{channel_id}:{message_id}"))
    }

    /// Key serializing mutations of one subject's state inside a channel.
    pub fn subject(scope: &str, channel_id: &str, user_id: &str) -> Self {
        Self(format!("{scope}:{channel_id}:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Cooperative cancellation signal carried by a lock handle.
pub enum LockFlow {
    Continue,
    Interrupted,
}

impl LockFlow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Error)]
pub enum EventLockError {
    #[error("timed out after {waited_ms}ms acquiring event lock '{key}'")]
    AcquireTimeout { key: EventLockKey, waited_ms: u64 },
}

#[derive(Debug)]
struct KeySlot {
    gate: Arc<AsyncMutex<()>>,
    interrupted: Arc<AtomicBool>,
    participants: usize,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    slots: HashMap<EventLockKey, KeySlot>,
    interrupted_until: HashMap<EventLockKey, Instant>,
}

#[derive(Debug)]
struct CoordinatorInner {
    state: Mutex<CoordinatorState>,
    interrupt_retention: Duration,
}

impl CoordinatorInner {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(self: &Arc<Self>, key: EventLockKey) -> SlotMembership {
        let mut state = self.lock_state();
        let now = Instant::now();
        state.interrupted_until.retain(|_, until| *until > now);
        let carried_interrupt = state.interrupted_until.remove(&key).is_some();

        let slot = state
            .slots
            .entry(key.clone())
            .or_insert_with(|| KeySlot {
                gate: Arc::new(AsyncMutex::new(())),
                interrupted: Arc::new(AtomicBool::new(false)),
                participants: 0,
            });
        if carried_interrupt {
            slot.interrupted.store(true, Ordering::SeqCst);
        }
        slot.participants += 1;

        SlotMembership {
            coordinator: Arc::clone(self),
            key,
            gate: Arc::clone(&slot.gate),
            interrupted: Arc::clone(&slot.interrupted),
            joined: true,
        }
    }

    fn leave(&self, key: &EventLockKey) {
        let mut state = self.lock_state();
        let interrupted = match state.slots.get_mut(key) {
            Some(slot) => {
                slot.participants = slot.participants.saturating_sub(1);
                if slot.participants > 0 {
                    return;
                }
                slot.interrupted.load(Ordering::SeqCst)
            }
            None => return,
        };
        state.slots.remove(key);
        if interrupted && !self.interrupt_retention.is_zero() {
            state
                .interrupted_until
                .insert(key.clone(), Instant::now() + self.interrupt_retention);
        }
    }
}

/// Registration of one caller (queued or holding) in a key's slot. Leaving is
/// tied to `Drop`, so an acquire future cancelled while queued leaves no trace.
struct SlotMembership {
    coordinator: Arc<CoordinatorInner>,
    key: EventLockKey,
    gate: Arc<AsyncMutex<()>>,
    interrupted: Arc<AtomicBool>,
    joined: bool,
}

impl SlotMembership {
    fn leave(&mut self) {
        if std::mem::take(&mut self.joined) {
            self.coordinator.leave(&self.key);
        }
    }
}

impl Drop for SlotMembership {
    fn drop(&mut self) {
        self.leave();
    }
}

#[derive(Debug, Clone)]
/// Keyed mutual exclusion for in-flight events.
///
/// Cloning is cheap; clones share the same key table. Acquisition for a key
/// waits (first come, first served) until every earlier holder released it and
/// never blocks callers using other keys.
pub struct EventLockCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for EventLockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLockCoordinator {
    pub fn new() -> Self {
        Self::with_interrupt_retention(DEFAULT_INTERRUPT_RETENTION)
    }

    pub fn with_interrupt_retention(interrupt_retention: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(CoordinatorState::default()),
                interrupt_retention,
            }),
        }
    }

    /// How long an interrupted key keeps reporting `Interrupted` after its
    /// last holder released it.
    pub fn interrupt_retention(&self) -> Duration {
        self.inner.interrupt_retention
    }

    /// Waits until no other handle for `key` is held, then returns a new one.
    pub async fn acquire(&self, key: EventLockKey) -> EventLockHandle {
        let membership = self.inner.join(key);
        let guard = Arc::clone(&membership.gate).lock_owned().await;
        let handle = EventLockHandle {
            membership,
            guard: Some(guard),
        };
        tracing::trace!(
            key = %handle.key(),
            flow = handle.flow().as_str(),
            "event lock acquired"
        );
        handle
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub async fn acquire_timeout(
        &self,
        key: EventLockKey,
        timeout: Duration,
    ) -> Result<EventLockHandle, EventLockError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.acquire(key.clone())).await {
            Ok(handle) => Ok(handle),
            Err(_) => Err(EventLockError::AcquireTimeout {
                key,
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// True while any caller holds or waits for `key`.
    pub fn is_locked(&self, key: &EventLockKey) -> bool {
        self.inner.lock_state().slots.contains_key(key)
    }

    /// Holders plus waiters currently registered for `key`.
    pub fn participant_count(&self, key: &EventLockKey) -> usize {
        self.inner
            .lock_state()
            .slots
            .get(key)
            .map(|slot| slot.participants)
            .unwrap_or(0)
    }

    pub fn tracked_key_count(&self) -> usize {
        self.inner.lock_state().slots.len()
    }
}

/// Exclusive hold on an [`EventLockKey`].
///
/// Releasing happens on [`release`](Self::release) or on drop, whichever comes
/// first, so every exit path (including unwinding) frees the key.
pub struct EventLockHandle {
    membership: SlotMembership,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EventLockHandle {
    pub fn key(&self) -> &EventLockKey {
        &self.membership.key
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    pub fn is_interrupted(&self) -> bool {
        self.membership.interrupted.load(Ordering::SeqCst)
    }

    pub fn flow(&self) -> LockFlow {
        if self.is_interrupted() {
            LockFlow::Interrupted
        } else {
            LockFlow::Continue
        }
    }

    /// Marks the event as consumed for every later holder of this key.
    /// Has no effect once the handle was released.
    pub fn interrupt(&mut self) -> bool {
        if self.guard.is_none() {
            tracing::debug!(key = %self.key(), "ignoring interrupt on released event lock");
            return false;
        }
        self.membership.interrupted.store(true, Ordering::SeqCst);
        tracing::debug!(key = %self.key(), "event lock interrupted");
        true
    }

    /// Frees the key for the next waiter. Returns false if already released.
    pub fn release(&mut self) -> bool {
        let Some(guard) = self.guard.take() else {
            return false;
        };
        drop(guard);
        self.membership.leave();
        tracing::trace!(key = %self.key(), "event lock released");
        true
    }
}

impl Drop for EventLockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for EventLockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLockHandle")
            .field("key", self.key())
            .field("held", &self.is_held())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

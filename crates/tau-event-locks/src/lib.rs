//! Keyed per-event locks with cooperative interruption.
//!
//! Independent processing stages that observe the same inbound event (word
//! filters, slowmode, logging) converge on one [`EventLockKey`] and take turns
//! holding it. A stage that has already consumed the event calls
//! [`EventLockHandle::interrupt`] so later stages for the same key see
//! [`LockFlow::Interrupted`] and skip their own work.
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use tau_event_locks::{EventLockCoordinator, EventLockKey, LockFlow};
//!
//! let locks = EventLockCoordinator::new();
//! let key = EventLockKey::message("channel-1", "message-9");
//!
//! let mut filter_stage = locks.acquire(key.clone()).await;
//! filter_stage.interrupt();
//! filter_stage.release();
//!
//! let slowmode_stage = locks.acquire(key).await;
//! assert_eq!(slowmode_stage.flow(), LockFlow::Interrupted);
//! # }
//! ```

pub mod event_lock_coordinator;

pub use event_lock_coordinator::*;

//! Bot-maintained channel slowmode for Tau.
//!
//! Instead of the platform's native rate limit, the bot restricts an author
//! for the configured window after each message, deletes anything they post
//! while restricted, and lifts the restriction when the window ends. State is
//! kept in a [`LeaseStore`] so restrictions still self-revert after a restart.
//!
//! Message handling is coordinated with other stages through
//! `tau_event_locks`: a stage that already removed a message interrupts the
//! message lock and the enforcer skips it; when the enforcer deletes a message
//! it interrupts the lock for the stages that follow.

pub mod slowmode_admin;
pub mod slowmode_cache;
pub mod slowmode_config;
pub mod slowmode_contract;
pub mod slowmode_eligibility;
pub mod slowmode_enforcer;
pub mod slowmode_expiry;
pub mod slowmode_platform;
pub mod slowmode_replay;
pub mod slowmode_sqlite_store;
pub mod slowmode_store;
#[cfg(test)]
mod slowmode_test_support;

pub use slowmode_admin::*;
pub use slowmode_cache::*;
pub use slowmode_config::*;
pub use slowmode_contract::*;
pub use slowmode_eligibility::*;
pub use slowmode_enforcer::*;
pub use slowmode_expiry::*;
pub use slowmode_platform::*;
pub use slowmode_replay::*;
pub use slowmode_sqlite_store::*;
pub use slowmode_store::*;

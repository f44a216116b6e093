//! Foundational low-level utilities shared across Tau crates.
//!
//! Provides unix-millisecond time helpers, the injectable [`Clock`] used by
//! lease expiry, and atomic file writes for persisted reports.

pub mod atomic_io;
pub mod clock;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use clock::{Clock, ManualClock, SystemClock};
pub use time_utils::{current_unix_timestamp_ms, is_expired_unix_ms, unix_ms_after};

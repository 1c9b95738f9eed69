//! Shared plumbing for the marketplace mesh crates: configuration,
//! logging bootstrap and the wall clock used for freshness decisions.

pub mod clock;
pub mod config;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;

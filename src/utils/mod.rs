//! Utility modules for the Reflag SDK.

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

//! Safety layer for vitalstore
//!
//! Two independent guardians:
//! - [`SafetyFallback`]: a persisted state machine that degrades the
//!   app's operating mode on prolonged network loss or repeated
//!   emergency-delivery failures, and raises local alerts on the way
//!   down
//! - [`StallDetector`]: a watchdog that notices a stuck queue and
//!   performs bounded self-healing (stale-lock release, index rebuild,
//!   a poke at the dispatcher)

#![warn(clippy::all)]

pub mod fallback;
pub mod stall;

pub use fallback::SafetyFallback;
pub use stall::{QueueProbe, RecoveryAction, StallDetector, StallEvent};

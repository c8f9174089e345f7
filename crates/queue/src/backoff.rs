//! Exponential backoff
//!
//! `delay = min(base · 2^attempts, cap)`, with the exponent clamped at
//! 20 so the multiplication cannot overflow. The dispatcher computes the
//! delay from the attempt count *before* incrementing it, so the first
//! failure waits one base interval.

use std::time::Duration;

/// Exponent clamp; beyond this every delay is the cap anyway.
const MAX_SHIFT: u32 = 20;

/// Compute the backoff delay for a given attempt count.
pub fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempts.min(MAX_SHIFT);
    let multiplier = 1u64 << shift;
    let delay_ms = (base.as_millis() as u64).saturating_mul(multiplier);
    Duration::from_millis(delay_ms).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(2);
    const CAP: Duration = Duration::from_secs(600);

    #[test]
    fn test_progression_doubles() {
        assert_eq!(backoff_delay(0, BASE, CAP), Duration::from_secs(2));
        assert_eq!(backoff_delay(1, BASE, CAP), Duration::from_secs(4));
        assert_eq!(backoff_delay(2, BASE, CAP), Duration::from_secs(8));
        assert_eq!(backoff_delay(3, BASE, CAP), Duration::from_secs(16));
    }

    #[test]
    fn test_cap_reached() {
        assert_eq!(backoff_delay(20, BASE, CAP), CAP);
        assert_eq!(backoff_delay(9, BASE, CAP), CAP, "2s * 512 > 600s");
    }

    #[test]
    fn test_huge_attempts_do_not_overflow() {
        assert_eq!(backoff_delay(u32::MAX, BASE, CAP), CAP);
    }

    #[test]
    fn test_emergency_profile() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(15);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(8));
        assert_eq!(backoff_delay(4, base, cap), cap);
    }
}

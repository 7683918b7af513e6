//! Linear-into-capped reconnect backoff.

use std::time::Duration;

/// Step added per completed attempt.
pub const BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Delay before the next attempt: `min(attempts * 2s, max_delay)`.
///
/// `attempts` counts attempts already made, so the first attempt of an
/// episode starts immediately.
pub fn reconnect_delay(attempts: u32, max_delay: Duration) -> Duration {
    BACKOFF_STEP.saturating_mul(attempts).min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let cap = Duration::from_secs(30);
        assert_eq!(reconnect_delay(0, cap), Duration::ZERO);
        assert_eq!(reconnect_delay(1, cap), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2, cap), Duration::from_secs(4));
        assert_eq!(reconnect_delay(14, cap), Duration::from_secs(28));
        assert_eq!(reconnect_delay(15, cap), cap);
        assert_eq!(reconnect_delay(u32::MAX, cap), cap);
    }
}

//! ABOUTME: Retry backoff schedule shared by the step handler envelope

use std::time::Duration;
use trinity_core::{BackoffKind, RetrySpec};

/// Delay before the given attempt (2-based: the first retry waits
/// `initial_delay`). Exponential backoff doubles per attempt and is capped
/// to keep worst-case waits bounded.
#[must_use]
pub fn backoff_delay(retry: &RetrySpec, next_attempt: u32) -> Duration {
    const MAX_DELAY: Duration = Duration::from_secs(300);
    let initial = retry.initial_delay();
    let delay = match retry.backoff {
        BackoffKind::Fixed => initial,
        BackoffKind::Exponential => {
            let exponent = next_attempt.saturating_sub(2).min(16);
            initial.saturating_mul(2u32.saturating_pow(exponent))
        }
    };
    delay.min(MAX_DELAY)
}

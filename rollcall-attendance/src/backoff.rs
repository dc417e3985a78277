use std::time::Duration;

use crate::config::SubmissionConfig;

/// Delay before the next attempt after `attempts` failed ones
///
/// Grows by `retry_multiplier` on every failure starting at
/// `retry_delay`, up to `max_retry_delay`. A server provided
/// `Retry-After` can only make the wait longer.
pub fn retry_delay(
    config: &SubmissionConfig,
    attempts: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let factor = config.retry_multiplier.max(1).saturating_pow(exponent);
    let delay = config
        .retry_delay
        .checked_mul(factor)
        .unwrap_or(config.max_retry_delay);

    retry_after
        .map_or(delay, |hint| delay.max(hint))
        .min(config.max_retry_delay)
}

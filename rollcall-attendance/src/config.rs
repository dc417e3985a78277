use std::time::Duration;

/// Attendance delivery configuration
#[derive(Clone, Debug)]
pub struct SubmissionConfig {
    /// Number of retries after the first failed attempt. An event that
    /// keeps failing after that is marked as failed.
    pub max_retry_attempts: u32,

    /// Delay before the first retry
    pub retry_delay: Duration,

    pub retry_multiplier: u32,

    pub max_retry_delay: Duration,

    /// How often the outbox is checked for events due for delivery
    pub tick_interval: Duration,

    /// Session poll interval, a session context older than twice this
    /// value is not used to tag new events
    pub session_check_interval: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(5_000),
            retry_multiplier: 2,
            max_retry_delay: Duration::from_millis(300_000),
            tick_interval: Duration::from_millis(1_000),
            session_check_interval: Duration::from_millis(60_000),
        }
    }
}

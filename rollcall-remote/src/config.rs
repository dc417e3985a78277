use std::time::Duration;

use crate::util::http::Uri;

/// Attendance server configuration
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub api_endpoint: Uri,
    pub request: RequestConfig,
}

#[derive(Clone, Debug)]
pub struct RequestConfig {
    /// Upper bound for any single request to the server
    pub timeout: Duration,

    pub heartbeat_interval: Duration,

    pub session_check_interval: Duration,

    /// How long the server waits without a heartbeat before it considers
    /// the device gone. Only advertised, the agent does not act on it.
    pub device_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(30_000),
            session_check_interval: Duration::from_millis(60_000),
            device_timeout: Duration::from_millis(300_000),
        }
    }
}

/// Network link supervision configuration
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Delay between connection attempts
    pub retry_delay: Duration,

    /// Time after which a connection attempt is reported as failed.
    /// Attempts continue in the background afterwards.
    pub timeout: Duration,

    /// How often the link is re-checked while connected
    pub check_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(5_000),
            timeout: Duration::from_millis(30_000),
            check_interval: Duration::from_millis(15_000),
        }
    }
}

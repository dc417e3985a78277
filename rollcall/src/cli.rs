use clap::{ArgAction, Parser};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::api::LocalAddress;
use crate::attendance::SubmissionConfig;
use crate::remote::{LinkConfig, RemoteConfig, RequestConfig};
use crate::util::http::Uri;

#[derive(Debug, Error)]
enum DurationError {
    #[error(transparent)]
    Invalid(#[from] ParseIntError),

    #[error("value must be greater than zero")]
    Zero,
}

// Timers and backoff need a non zero period
fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let millis: u64 = s.parse()?;
    if millis == 0 {
        return Err(DurationError::Zero);
    }
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Attendance server base URI, e.g. "http://10.0.0.2:8000/api/devices"
    #[arg(env = "ROLLCALL_SERVER_URL", long = "server-url", value_name = "uri")]
    pub server_url: Option<Uri>,

    /// Device identifier as known by the server registry
    #[arg(env = "ROLLCALL_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: Option<String>,

    /// Human readable device name
    #[arg(
        env = "ROLLCALL_DISPLAY_NAME",
        long = "display-name",
        value_name = "name"
    )]
    pub display_name: Option<String>,

    /// Location of the device, used to find the active course session
    #[arg(env = "ROLLCALL_LOCATION", long = "location", value_name = "str")]
    pub location: Option<String>,

    /// Register the device with the server on startup
    #[arg(
        env = "ROLLCALL_REGISTER",
        long = "register",
        action = ArgAction::SetTrue,
        requires = "server_url"
    )]
    pub register: bool,

    /// Heartbeat interval in milliseconds
    #[arg(
        env = "ROLLCALL_HEARTBEAT_INTERVAL_MS",
        long = "heartbeat-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        requires = "server_url"
    )]
    pub heartbeat_interval: Option<Duration>,

    /// Active session check interval in milliseconds
    #[arg(
        env = "ROLLCALL_SESSION_CHECK_INTERVAL_MS",
        long = "session-check-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub session_check_interval: Option<Duration>,

    /// Time without heartbeats after which the server considers the device
    /// offline, in milliseconds
    #[arg(
        env = "ROLLCALL_DEVICE_TIMEOUT_MS",
        long = "device-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        requires = "server_url"
    )]
    pub device_timeout: Option<Duration>,

    /// Server request timeout in milliseconds
    #[arg(
        env = "ROLLCALL_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        requires = "server_url"
    )]
    pub request_timeout: Option<Duration>,

    /// Delay between network connection attempts in milliseconds
    #[arg(
        env = "ROLLCALL_LINK_RETRY_DELAY_MS",
        long = "link-retry-delay-ms",
        value_name = "ms",
        value_parser = parse_duration,
        requires = "server_url"
    )]
    pub link_retry_delay: Option<Duration>,

    /// Time after which a connection attempt is reported as failed, in
    /// milliseconds
    #[arg(
        env = "ROLLCALL_LINK_TIMEOUT_MS",
        long = "link-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        requires = "server_url"
    )]
    pub link_timeout: Option<Duration>,

    /// Network link check interval in milliseconds
    #[arg(
        env = "ROLLCALL_LINK_CHECK_INTERVAL_MS",
        long = "link-check-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        requires = "server_url"
    )]
    pub link_check_interval: Option<Duration>,

    /// Attendance submission retries before giving up on a record
    #[arg(
        env = "ROLLCALL_MAX_RETRY_ATTEMPTS",
        long = "max-retry-attempts",
        value_name = "int"
    )]
    pub max_retry_attempts: Option<u32>,

    /// Attendance submission retry base delay in milliseconds
    #[arg(
        env = "ROLLCALL_RETRY_DELAY_MS",
        long = "retry-delay-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub retry_delay: Option<Duration>,

    /// Attendance submission retry delay multiplier
    #[arg(
        env = "ROLLCALL_RETRY_MULTIPLIER",
        long = "retry-multiplier",
        value_name = "int",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub retry_multiplier: Option<u32>,

    /// Maximum attendance submission retry delay in milliseconds
    #[arg(
        env = "ROLLCALL_MAX_RETRY_DELAY_MS",
        long = "max-retry-delay-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub max_retry_delay: Option<Duration>,

    /// How often pending attendance records are checked, in milliseconds
    #[arg(
        env = "ROLLCALL_SUBMISSION_TICK_MS",
        long = "submission-tick-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub submission_tick: Option<Duration>,

    /// Keep state in memory only, nothing survives a restart
    #[arg(
        env = "ROLLCALL_NO_PERSISTENCE",
        long = "no-persistence",
        action = ArgAction::SetTrue,
        conflicts_with = "data_dir"
    )]
    pub no_persistence: bool,

    /// Directory for persisted state
    #[arg(env = "ROLLCALL_DATA_DIR", long = "data-dir", value_name = "path")]
    pub data_dir: Option<PathBuf>,

    /// Local API listen address
    #[arg(
        env = "ROLLCALL_LOCAL_API_ADDRESS",
        long = "local-api-address",
        value_name = "addr"
    )]
    pub local_api_address: Option<LocalAddress>,
}

impl Cli {
    /// Server configuration, if the agent runs managed
    pub fn remote_config(&self) -> Option<RemoteConfig> {
        let api_endpoint = self.server_url.clone()?;
        let defaults = RequestConfig::default();
        Some(RemoteConfig {
            api_endpoint,
            request: RequestConfig {
                timeout: self.request_timeout.unwrap_or(defaults.timeout),
                heartbeat_interval: self
                    .heartbeat_interval
                    .unwrap_or(defaults.heartbeat_interval),
                session_check_interval: self
                    .session_check_interval
                    .unwrap_or(defaults.session_check_interval),
                device_timeout: self.device_timeout.unwrap_or(defaults.device_timeout),
            },
        })
    }

    pub fn link_config(&self) -> LinkConfig {
        let defaults = LinkConfig::default();
        LinkConfig {
            retry_delay: self.link_retry_delay.unwrap_or(defaults.retry_delay),
            timeout: self.link_timeout.unwrap_or(defaults.timeout),
            check_interval: self.link_check_interval.unwrap_or(defaults.check_interval),
        }
    }

    pub fn submission_config(&self) -> SubmissionConfig {
        let defaults = SubmissionConfig::default();
        SubmissionConfig {
            max_retry_attempts: self
                .max_retry_attempts
                .unwrap_or(defaults.max_retry_attempts),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            retry_multiplier: self.retry_multiplier.unwrap_or(defaults.retry_multiplier),
            max_retry_delay: self.max_retry_delay.unwrap_or(defaults.max_retry_delay),
            tick_interval: self.submission_tick.unwrap_or(defaults.tick_interval),
            session_check_interval: self
                .session_check_interval
                .unwrap_or(defaults.session_check_interval),
        }
    }
}

pub fn parse() -> Cli {
    Parser::parse()
}

//! Network link supervision. Establishes the link to the attendance server,
//! keeps checking it while it is up and reports every state transition to
//! subscribers through a watch channel.

use serde::Serialize;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::LinkConfig;
use crate::util::http::Uri;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the link as published to subscribers
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub state: LinkState,

    /// Number of times the link went into `Connected`. Subscribers compare
    /// it with the last value they saw to detect a reconnect, even if they
    /// missed the intermediate states.
    pub reconnects: u64,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link check timed out after {0:?}")]
    CheckTimeout(Duration),

    #[error("link check failed: {0}")]
    Check(#[from] io::Error),

    #[error("link not established after {0:?}")]
    LinkTimeout(Duration),
}

/// Checks whether the network link is usable
///
/// Bringing up the radio is outside of the agent; a check only tells
/// whether the server can be reached right now.
pub trait LinkCheck: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// Check the link by opening a TCP connection to the server
#[derive(Debug, Clone)]
pub struct TcpCheck {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpCheck {
    pub fn new(server: &Uri, timeout: Duration) -> Self {
        Self {
            host: server.host().unwrap_or("localhost").to_owned(),
            port: server.port_or_default(),
            timeout,
        }
    }
}

impl LinkCheck for TcpCheck {
    async fn check(&self) -> Result<(), LinkError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(LinkError::CheckTimeout(self.timeout)),
        }
    }
}

/// Owns the link state. Other components only get read access through
/// [`ConnectivityManager::subscribe`].
pub struct ConnectivityManager<P> {
    checker: P,
    config: LinkConfig,
    status_tx: watch::Sender<LinkStatus>,
}

impl<P: LinkCheck> ConnectivityManager<P> {
    pub fn new(checker: P, config: &LinkConfig) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            checker,
            config: config.clone(),
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_state(&self) -> LinkState {
        self.status_tx.borrow().state
    }

    fn set_state(&self, state: LinkState) {
        self.status_tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            if state == LinkState::Connected {
                status.reconnects += 1;
            }
            info!(from = ?status.state, to = ?state, "link state changed");
            status.state = state;
            true
        });
    }

    /// Try to establish the link
    ///
    /// Checks every `retry_delay` until the link is up. Returns
    /// [`LinkError::LinkTimeout`] once `timeout` has passed without success,
    /// leaving the link `Disconnected`.
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.set_state(LinkState::Connecting);
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match self.checker.check().await {
                Ok(()) => {
                    self.set_state(LinkState::Connected);
                    return Ok(());
                }
                Err(err) => debug!("connection attempt failed: {err}"),
            }

            if Instant::now() + self.config.retry_delay > deadline {
                self.set_state(LinkState::Disconnected);
                return Err(LinkError::LinkTimeout(self.config.timeout));
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Supervise the link forever
    ///
    /// A missing network is expected on the device, so failures here are
    /// only logged and connection attempts never stop.
    pub async fn run(&self) {
        loop {
            if self.current_state() != LinkState::Connected {
                if let Err(err) = self.connect().await {
                    warn!("{err}, will keep trying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                continue;
            }

            tokio::time::sleep(self.config.check_interval).await;
            if let Err(err) = self.checker.check().await {
                warn!("link lost: {err}");
                self.set_state(LinkState::Disconnected);
            }
        }
    }
}

/// Start link supervision
#[instrument(name = "link", skip_all)]
pub async fn start_link<P: LinkCheck>(manager: ConnectivityManager<P>) {
    info!("ready");
    manager.run().await
}

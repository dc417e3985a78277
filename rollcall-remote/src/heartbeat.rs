use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::{self, Future};
use std::pin::Pin;
use tokio::sync::watch::{Receiver, Sender};
use tokio::time::MissedTickBehavior;
use tracing::{Span, debug, error, field, info, instrument, trace, warn};

use crate::config::RemoteConfig;
use crate::identity::DeviceIdentity;
use crate::link::LinkStatus;
use crate::request::{Endpoint, RequestError};
use crate::util::types::DeviceId;

/// Number of attendance events not yet delivered, as published by the
/// submission pipeline
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Backlog {
    pub pending: usize,
    pub failed: usize,
}

/// Outcome of the latest heartbeats. Lives in memory only, the next
/// successful heartbeat after a reboot makes up for it.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub last_sent: Option<DateTime<Utc>>,
    pub last_ack: Option<DateTime<Utc>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Heartbeat {
    device_id: DeviceId,
    display_name: String,
    location: String,
    timestamp: DateTime<Utc>,
    link: LinkStatus,
    pending_submissions: usize,
    failed_submissions: usize,
    device_timeout_ms: u64,
}

impl Heartbeat {
    fn new(
        identity: &DeviceIdentity,
        config: &RemoteConfig,
        link: LinkStatus,
        backlog: Backlog,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            display_name: identity.display_name.clone(),
            location: identity.location.clone(),
            timestamp,
            link,
            pending_submissions: backlog.pending,
            failed_submissions: backlog.failed,
            device_timeout_ms: config.request.device_timeout.as_millis() as u64,
        }
    }
}

type HeartbeatFuture = Pin<Box<dyn Future<Output = Result<(), RequestError>> + Send>>;

/// Announce device liveness every heartbeat interval while the link is up
///
/// At most one heartbeat is in flight. A tick that finds the previous
/// heartbeat still pending is skipped, and a failed heartbeat is not
/// retried, the next tick takes care of it.
#[instrument(name = "heartbeat", skip_all, fields(success_rate = field::Empty))]
pub async fn start_heartbeat(
    config: &RemoteConfig,
    identity: &DeviceIdentity,
    mut link_rx: Receiver<LinkStatus>,
    backlog_rx: Receiver<Backlog>,
    record_tx: Sender<HeartbeatRecord>,
) {
    let endpoint = match Endpoint::new(&config.api_endpoint, "/heartbeat", config.request.timeout)
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("invalid heartbeat endpoint: {e}");
            return future::pending::<()>().await;
        }
    };
    info!("ready");

    let mut ticker = tokio::time::interval(config.request.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut heartbeat_future: HeartbeatFuture = Box::pin(future::pending());
    let mut in_flight = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let link = *link_rx.borrow();
                if !link.is_connected() {
                    trace!("link is down, skipping heartbeat");
                    continue;
                }
                if in_flight {
                    debug!("previous heartbeat still in flight, skipping tick");
                    continue;
                }

                let now = Utc::now();
                let heartbeat = Heartbeat::new(identity, config, link, *backlog_rx.borrow(), now);
                let endpoint = endpoint.clone();
                heartbeat_future = Box::pin(async move { endpoint.post(&heartbeat).await });
                in_flight = true;
                record_tx.send_modify(|record| record.last_sent = Some(now));
            }

            res = &mut heartbeat_future => {
                heartbeat_future = Box::pin(future::pending());
                in_flight = false;
                match res {
                    Ok(()) => {
                        trace!("heartbeat acknowledged");
                        record_tx.send_modify(|record| record.last_ack = Some(Utc::now()));
                    }
                    Err(e) => warn!("heartbeat failed: {e}"),
                }
                Span::current().record("success_rate", endpoint.metrics().success_rate());
            }

            changed = link_rx.changed() => {
                if changed.is_err() {
                    trace!("link channel closed");
                    break;
                }

                let connected = link_rx.borrow_and_update().is_connected();
                if !connected && in_flight {
                    // the request would only fail after the timeout
                    debug!("link lost, abandoning heartbeat");
                    heartbeat_future = Box::pin(future::pending());
                    in_flight = false;
                }
            }
        }
    }
}

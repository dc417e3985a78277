use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::{self, Future};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch::{Receiver, Sender};
use tokio::time::Instant;
use tracing::{Span, debug, error, field, info, instrument, trace, warn};

use crate::config::RemoteConfig;
use crate::identity::DeviceIdentity;
use crate::link::LinkStatus;
use crate::request::{Endpoint, RequestError};

/// The course session the server reports as active for the device location
///
/// A context is only ever replaced as a whole, so readers always see the
/// fields of a single server response. The latest context is also stored,
/// so it can still be used after a quick reboot until it becomes stale.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub course_title: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

impl SessionContext {
    /// Key of the session document in the state store
    pub const fn kind() -> &'static str {
        "session"
    }

    /// A context is stale when it has not been refreshed within twice the
    /// poll interval
    pub fn is_stale(&self, now: DateTime<Utc>, poll_interval: Duration) -> bool {
        // an interval too large for chrono can never be exceeded
        let Ok(limit) = chrono::Duration::from_std(poll_interval * 2) else {
            return false;
        };
        now - self.fetched_at > limit
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Session id that new attendance events should be tagged with
    ///
    /// Returns `None` if the context can no longer be trusted. The server
    /// deals with unattributed events, the device never guesses.
    pub fn attributable_session(&self, now: DateTime<Utc>, poll_interval: Duration) -> Option<&str> {
        if self.is_stale(now, poll_interval) || self.is_expired(now) {
            return None;
        }
        self.session_id.as_deref()
    }
}

/// Active session response. A missing session is a valid answer.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ActiveSession {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    course_id: Option<String>,
    #[serde(default)]
    course_title: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// A session refresh request coming from the local API
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PollRequest;

/// Query the server for the session currently active at `location`
pub async fn fetch_session(
    endpoint: &Endpoint,
    location: &str,
) -> Result<SessionContext, RequestError> {
    let ActiveSession {
        session_id,
        course_id,
        course_title,
        expires_at,
    } = endpoint.get(&[("location", location)]).await?;

    Ok(SessionContext {
        session_id,
        course_id,
        course_title,
        expires_at,
        fetched_at: Utc::now(),
    })
}

type PollFuture = Pin<Box<dyn Future<Output = Result<SessionContext, RequestError>> + Send>>;

fn poll_session(endpoint: &Endpoint, location: &str) -> PollFuture {
    let endpoint = endpoint.clone();
    let location = location.to_owned();
    Box::pin(async move { fetch_session(&endpoint, &location).await })
}

/// Keep the session context up to date
///
/// Polls every session check interval while the link is up, and right away
/// whenever the link comes back or a refresh is requested. A failed poll
/// leaves the previous context in place, to age until it becomes stale.
#[instrument(name = "session", skip_all, fields(success_rate = field::Empty))]
pub async fn start_poll(
    config: &RemoteConfig,
    identity: &DeviceIdentity,
    mut link_rx: Receiver<LinkStatus>,
    mut poll_rx: Receiver<PollRequest>,
    session_tx: Sender<Option<SessionContext>>,
) {
    let endpoint = match Endpoint::new(
        &config.api_endpoint,
        "/active-session",
        config.request.timeout,
    ) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("invalid session endpoint: {e}");
            return future::pending::<()>().await;
        }
    };
    let interval = config.request.session_check_interval;
    let location = identity.location.as_str();
    info!("ready");

    let initial = *link_rx.borrow_and_update();
    let mut seen_reconnects = initial.reconnects;
    let mut next_poll_time = Instant::now() + interval;
    let mut poll_future: PollFuture = Box::pin(future::pending());
    let mut polling = false;
    if initial.is_connected() {
        poll_future = poll_session(&endpoint, location);
        polling = true;
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_poll_time) => {
                next_poll_time = Instant::now() + interval;
                if !link_rx.borrow().is_connected() {
                    trace!("link is down, skipping poll");
                    continue;
                }
                if polling {
                    trace!("previous poll still in progress");
                    continue;
                }
                poll_future = poll_session(&endpoint, location);
                polling = true;
            }

            res = &mut poll_future => {
                poll_future = Box::pin(future::pending());
                polling = false;
                match res {
                    Ok(context) => {
                        let previous = session_tx.send_replace(Some(context.clone()));
                        let session_changed = previous
                            .is_none_or(|previous| previous.session_id != context.session_id);
                        if session_changed {
                            match context.session_id.as_deref() {
                                Some(id) => info!(session = id, course = ?context.course_id, "active session changed"),
                                None => info!("no active session"),
                            }
                        }
                    }
                    Err(e) => warn!("session poll failed: {e}, keeping the previous context"),
                }
                Span::current().record("success_rate", endpoint.metrics().success_rate());
            }

            changed = link_rx.changed() => {
                if changed.is_err() {
                    trace!("link channel closed");
                    break;
                }

                let status = *link_rx.borrow_and_update();
                if status.is_connected() && status.reconnects != seen_reconnects {
                    seen_reconnects = status.reconnects;
                    debug!("link is back, polling now");
                    drop(poll_future);
                    poll_future = poll_session(&endpoint, location);
                    polling = true;
                    next_poll_time = Instant::now() + interval;
                } else if !status.is_connected() && polling {
                    debug!("link lost, abandoning poll");
                    poll_future = Box::pin(future::pending());
                    polling = false;
                }
            }

            Ok(()) = poll_rx.changed() => {
                if !link_rx.borrow().is_connected() {
                    debug!("refresh requested while the link is down, will poll on reconnect");
                    continue;
                }
                debug!("refresh requested");
                drop(poll_future);
                poll_future = poll_session(&endpoint, location);
                polling = true;
                next_poll_time = Instant::now() + interval;
            }
        }
    }
}

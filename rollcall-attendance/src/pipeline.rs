use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::backoff::retry_delay;
use crate::config::SubmissionConfig;
use crate::model::{AttendanceEvent, Capture, CaptureOutcome, EventStatus};
use crate::outbox::{Outbox, Slot};
use crate::remote::{Backlog, LinkStatus, RequestError, SessionContext};
use crate::store::StateStore;

const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_PERSIST_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delivers a single attendance event to the server
pub trait Submitter: Send + Sync + 'static {
    fn submit(
        &self,
        event: &AttendanceEvent,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
}

/// Sequential delivery of attendance events
///
/// The pipeline is the only writer of attendance events. Every status
/// change reaches the store before the next event is looked at.
pub struct Pipeline<S> {
    config: SubmissionConfig,
    store: StateStore,
    submitter: Option<S>,
    outbox: Outbox,
    session_rx: watch::Receiver<Option<SessionContext>>,
    backlog_tx: watch::Sender<Backlog>,
}

impl<S: Submitter> Pipeline<S> {
    /// Create the pipeline from the events found on the store
    ///
    /// Without a submitter the pipeline only captures events, nothing is
    /// ever sent.
    pub fn new(
        config: &SubmissionConfig,
        store: StateStore,
        submitter: Option<S>,
        events: Vec<AttendanceEvent>,
        session_rx: watch::Receiver<Option<SessionContext>>,
        backlog_tx: watch::Sender<Backlog>,
    ) -> Self {
        let pipeline = Self {
            config: config.clone(),
            store,
            submitter,
            outbox: Outbox::new(events),
            session_rx,
            backlog_tx,
        };
        pipeline.publish_backlog();
        pipeline
    }

    pub fn backlog(&self) -> Backlog {
        Backlog {
            pending: self.outbox.pending_count(),
            failed: self.outbox.failed_count(),
        }
    }

    fn publish_backlog(&self) {
        self.backlog_tx.send_replace(self.backlog());
    }

    /// Accept an attendance record
    ///
    /// The record is tagged with the current session, unless the session
    /// context is stale or expired. If the student already has an active
    /// event for that session the record collapses into it.
    pub async fn capture(
        &mut self,
        student_token: String,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Capture {
        let session_id = self.session_rx.borrow().as_ref().and_then(|ctx| {
            ctx.attributable_session(now, self.config.session_check_interval)
                .map(String::from)
        });

        let event = AttendanceEvent::new(student_token, timestamp, session_id);
        if let Some(existing) = self.outbox.find(&event.key()) {
            debug!(event = %existing.id, attempts = existing.attempts, "duplicate attendance collapsed");
            return Capture {
                id: existing.id.clone(),
                outcome: CaptureOutcome::Collapsed,
                session_id: existing.session_id.clone(),
            };
        }

        let event = AttendanceEvent {
            next_retry_at: now,
            ..event
        };
        self.persist(&event).await;
        info!(event = %event.id, session = ?event.session_id, "attendance captured");

        let capture = Capture {
            id: event.id.clone(),
            outcome: CaptureOutcome::Captured,
            session_id: event.session_id.clone(),
        };
        self.outbox.insert(event);
        self.publish_backlog();
        capture
    }

    /// Attempt delivery of every event that is due
    ///
    /// Stops as soon as the link goes down, remaining events wait for the
    /// next tick.
    pub async fn tick(&mut self, now: DateTime<Utc>, link_rx: &watch::Receiver<LinkStatus>) {
        let start = Instant::now();
        loop {
            let connected = link_rx.borrow().is_connected();
            let elapsed = chrono::Duration::from_std(start.elapsed()).unwrap_or_default();
            if !self.step(now + elapsed, connected).await {
                break;
            }
        }
    }

    /// Attempt delivery of the oldest due event
    ///
    /// Returns false if there was nothing to attempt, either because no
    /// event is due or because the link is down.
    pub async fn step(&mut self, now: DateTime<Utc>, connected: bool) -> bool {
        if self.submitter.is_none() {
            return false;
        }
        if !connected {
            trace!("link is down, deferring delivery");
            return false;
        }
        let Some(slot) = self.outbox.next_due(now) else {
            return false;
        };

        self.deliver(&slot, now).await;
        self.publish_backlog();
        true
    }

    async fn deliver(&mut self, slot: &Slot, now: DateTime<Utc>) {
        let Some(submitter) = self.submitter.as_ref() else {
            return;
        };
        let Some(event) = self.outbox.get_mut(slot) else {
            return;
        };

        event.status = EventStatus::InFlight;
        let event = event.clone();
        self.persist(&event).await;

        let start = Instant::now();
        let res = submitter.submit(&event).await;
        let now = now + chrono::Duration::from_std(start.elapsed()).unwrap_or_default();

        match res {
            Ok(()) => {
                self.outbox.remove(slot);
                self.forget(&event).await;
                info!(event = %event.id, "attendance acknowledged");
            }
            Err(err) => self.handle_failure(slot, event, err, now).await,
        }
    }

    async fn handle_failure(
        &mut self,
        slot: &Slot,
        event: AttendanceEvent,
        err: RequestError,
        now: DateTime<Utc>,
    ) {
        let attempts = event.attempts + 1;
        let last_error = Some(err.to_string());

        if !err.is_retryable() || attempts > self.config.max_retry_attempts {
            let event = AttendanceEvent {
                status: EventStatus::Failed,
                attempts,
                last_error,
                ..event
            };
            self.persist(&event).await;
            warn!(event = %event.id, attempts, "attendance event failed: {err}");
            if let Some(stored) = self.outbox.get_mut(slot) {
                *stored = event;
            }
            self.outbox.fail(slot);
            return;
        }

        let delay = retry_delay(&self.config, attempts, err.retry_after());
        let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        let event = AttendanceEvent {
            status: EventStatus::Pending,
            attempts,
            next_retry_at,
            last_error,
            ..event
        };
        self.persist(&event).await;
        debug!(event = %event.id, attempts, "delivery failed: {err}, retrying in {delay:?}");
        if let Some(stored) = self.outbox.get_mut(slot) {
            *stored = event;
        }
    }

    /// Make every pending event due right away
    pub async fn expedite(&mut self, now: DateTime<Utc>) {
        let changed = self.outbox.expedite(now);
        if !changed.is_empty() {
            debug!(count = changed.len(), "rescheduling pending events");
        }
        for event in changed {
            self.persist(&event).await;
        }
    }

    pub fn failed(&self) -> Vec<AttendanceEvent> {
        self.outbox.failed()
    }

    /// Remove failed events from the device and return them
    pub async fn flush_failed(&mut self) -> Vec<AttendanceEvent> {
        let failed = self.outbox.take_failed();
        for event in failed.iter() {
            self.forget(event).await;
        }
        if !failed.is_empty() {
            info!(count = failed.len(), "failed events flushed");
        }
        self.publish_backlog();
        failed
    }

    // Write an event to the store, retrying until it succeeds
    async fn persist(&self, event: &AttendanceEvent) {
        let mut delay = PERSIST_RETRY_DELAY;
        while let Err(e) = self.store.save(event).await {
            error!(event = %event.id, "failed to persist event: {e}, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_PERSIST_RETRY_DELAY);
        }
    }

    // Remove an event from the store, retrying until it succeeds
    async fn forget(&self, event: &AttendanceEvent) {
        let mut delay = PERSIST_RETRY_DELAY;
        while let Err(e) = self.store.remove(event).await {
            error!(event = %event.id, "failed to remove event: {e}, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_PERSIST_RETRY_DELAY);
        }
    }
}

/// Requests served by a running pipeline
pub enum Command {
    Capture {
        student_token: String,
        timestamp: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Capture>,
    },
    ListFailed {
        reply: oneshot::Sender<Vec<AttendanceEvent>>,
    },
    FlushFailed {
        reply: oneshot::Sender<Vec<AttendanceEvent>>,
    },
}

#[derive(Debug, Error)]
#[error("attendance pipeline is not running")]
pub struct PipelineClosed;

/// Access to a running pipeline from other tasks
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Command>,
}

impl PipelineHandle {
    /// Create a handle and the receiving end to pass to [`start_submit`]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Hand over an attendance record. The device time is used if no
    /// timestamp is given.
    pub async fn capture(
        &self,
        student_token: String,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Capture, PipelineClosed> {
        self.request(|reply| Command::Capture {
            student_token,
            timestamp,
            reply,
        })
        .await
    }

    pub async fn failed(&self) -> Result<Vec<AttendanceEvent>, PipelineClosed> {
        self.request(|reply| Command::ListFailed { reply }).await
    }

    pub async fn flush_failed(&self) -> Result<Vec<AttendanceEvent>, PipelineClosed> {
        self.request(|reply| Command::FlushFailed { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PipelineClosed> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| PipelineClosed)?;
        response.await.map_err(|_| PipelineClosed)
    }
}

/// Run the submission pipeline
///
/// Due events are attempted on every tick while the link is up. When the
/// link comes back all pending events are made due and attempted right
/// away. Newly captured events are attempted immediately if possible.
///
/// Events are delivered one at a time and pending commands are served in
/// between, so a large backlog does not hold up new captures.
#[instrument(name = "submit", skip_all)]
pub async fn start_submit<S: Submitter>(
    mut pipeline: Pipeline<S>,
    mut link_rx: watch::Receiver<LinkStatus>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let backlog = pipeline.backlog();
    info!(pending = backlog.pending, failed = backlog.failed, "ready");

    let mut ticker = tokio::time::interval(pipeline.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seen_reconnects = link_rx.borrow_and_update().reconnects;
    let mut draining = false;

    loop {
        let connected = link_rx.borrow().is_connected();
        tokio::select! {
            biased;

            Some(command) = cmd_rx.recv() => match command {
                Command::Capture { student_token, timestamp, reply } => {
                    let now = Utc::now();
                    let capture = pipeline
                        .capture(student_token, timestamp.unwrap_or(now), now)
                        .await;
                    if capture.outcome == CaptureOutcome::Captured {
                        draining = true;
                    }
                    if reply.send(capture).is_err() {
                        trace!("capture requester went away");
                    }
                }
                Command::ListFailed { reply } => {
                    let _ = reply.send(pipeline.failed());
                }
                Command::FlushFailed { reply } => {
                    let failed = pipeline.flush_failed().await;
                    let _ = reply.send(failed);
                }
            },

            Ok(()) = link_rx.changed() => {
                let status = *link_rx.borrow_and_update();
                if status.is_connected() && status.reconnects != seen_reconnects {
                    seen_reconnects = status.reconnects;
                    pipeline.expedite(Utc::now()).await;
                    draining = true;
                }
            }

            _ = ticker.tick() => {
                draining = true;
            }

            more = pipeline.step(Utc::now(), connected), if draining => {
                draining = more;
            }
        }
    }
}

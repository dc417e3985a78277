use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::model::{AttendanceEvent, EventStatus};
use crate::remote::{DeviceIdentity, SessionContext};
use crate::util::store::{Store, StoreError};
use crate::util::types::Uuid;

const EVENTS_PATH: &str = "/events";

/// Everything that survives a restart
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub identity: Option<DeviceIdentity>,

    /// Last session reported by the server, it may be stale by now
    pub session: Option<SessionContext>,

    /// Undelivered events, oldest capture first
    pub events: Vec<AttendanceEvent>,
}

#[derive(Debug, Default)]
struct Memory {
    identity: Option<DeviceIdentity>,
    session: Option<SessionContext>,
    events: BTreeMap<Uuid, AttendanceEvent>,
}

/// Device state storage
///
/// The disk backend writes every document atomically, a crash leaves
/// either the new or the previous version in place. With persistence
/// disabled the memory backend keeps the same contract for the lifetime
/// of the process only.
#[derive(Debug, Clone)]
pub struct StateStore {
    backend: Backend,
}

#[derive(Debug, Clone)]
enum Backend {
    Disk(Store),
    Memory(Arc<Mutex<Memory>>),
}

impl StateStore {
    pub fn disk<P: AsRef<Path>>(root: P) -> Self {
        Self {
            backend: Backend::Disk(Store::new(root)),
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::default()),
        }
    }

    pub async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        match &self.backend {
            Backend::Disk(store) => store.read("/", DeviceIdentity::kind()).await,
            Backend::Memory(memory) => Ok(memory.lock().await.identity.clone()),
        }
    }

    pub async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Disk(store) => store.write("/", DeviceIdentity::kind(), identity).await,
            Backend::Memory(memory) => {
                memory.lock().await.identity = Some(identity.clone());
                Ok(())
            }
        }
    }

    pub async fn load_session(&self) -> Result<Option<SessionContext>, StoreError> {
        match &self.backend {
            Backend::Disk(store) => store.read("/", SessionContext::kind()).await,
            Backend::Memory(memory) => Ok(memory.lock().await.session.clone()),
        }
    }

    pub async fn save_session(&self, session: &SessionContext) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Disk(store) => store.write("/", SessionContext::kind(), session).await,
            Backend::Memory(memory) => {
                memory.lock().await.session = Some(session.clone());
                Ok(())
            }
        }
    }

    /// Read the stored state
    ///
    /// Events left in flight by a previous run may or may not have reached
    /// the server, they are made pending and due at `now`, and written
    /// back before returning.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<PersistedState, StoreError> {
        let identity = self.load_identity().await?;
        let session = match self.load_session().await {
            Ok(session) => session,
            // only a hint, the next poll replaces it
            Err(StoreError::Serialization(e)) => {
                warn!("ignoring unreadable session: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        for event in self.read_events().await? {
            match event.status {
                EventStatus::Acknowledged => {
                    // leftover from a crash between acknowledgment and removal
                    self.remove(&event).await?;
                }
                EventStatus::InFlight => {
                    let event = AttendanceEvent {
                        status: EventStatus::Pending,
                        next_retry_at: now,
                        ..event
                    };
                    debug!(event = %event.id, "resetting interrupted event");
                    self.save(&event).await?;
                    events.push(event);
                }
                EventStatus::Pending | EventStatus::Failed => events.push(event),
            }
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        Ok(PersistedState {
            identity,
            session,
            events,
        })
    }

    async fn read_events(&self) -> Result<Vec<AttendanceEvent>, StoreError> {
        match &self.backend {
            Backend::Disk(store) => {
                let mut events = Vec::new();
                for key in store.list(EVENTS_PATH).await? {
                    match store.read::<_, AttendanceEvent>(EVENTS_PATH, &key).await {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        // keep the document around for inspection but
                        // do not let it block the rest of the outbox
                        Err(StoreError::Serialization(e)) => {
                            warn!("ignoring unreadable event {key}: {e}")
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(events)
            }
            Backend::Memory(memory) => Ok(memory.lock().await.events.values().cloned().collect()),
        }
    }

    /// Create or replace the stored copy of an event
    pub async fn save(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Disk(store) => store.write(EVENTS_PATH, &event.id, event).await,
            Backend::Memory(memory) => {
                memory
                    .lock()
                    .await
                    .events
                    .insert(event.id.clone(), event.clone());
                Ok(())
            }
        }
    }

    /// Remove an event. Removing an unknown event succeeds.
    pub async fn remove(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Disk(store) => store.delete(EVENTS_PATH, &event.id).await,
            Backend::Memory(memory) => {
                memory.lock().await.events.remove(&event.id);
                Ok(())
            }
        }
    }
}

/// Store every new session context reported by the server
///
/// Write failures are logged and not retried, the following poll brings
/// a fresh context anyway.
#[instrument(name = "session_store", skip_all)]
pub async fn start_session_store(
    store: StateStore,
    mut session_rx: watch::Receiver<Option<SessionContext>>,
) {
    info!("ready");

    while session_rx.changed().await.is_ok() {
        let session = session_rx.borrow_and_update().clone();
        let Some(session) = session else {
            continue;
        };
        match store.save_session(&session).await {
            Ok(()) => trace!(session = ?session.session_id, "session stored"),
            Err(e) => warn!("failed to store session: {e}"),
        }
    }
    trace!("session channel closed");
}

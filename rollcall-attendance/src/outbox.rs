use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::model::{AttendanceEvent, EventKey, EventStatus};
use crate::util::types::Uuid;

/// Position of an event in the outbox. Events are ordered by capture time,
/// the id breaks ties.
pub type Slot = (DateTime<Utc>, Uuid);

/// In memory view of the undelivered events
///
/// Events still to be delivered are kept in capture order. An index by
/// natural key makes duplicate detection independent of the backlog size.
#[derive(Debug, Default)]
pub struct Outbox {
    active: BTreeMap<Slot, AttendanceEvent>,
    by_key: HashMap<EventKey, Slot>,
    failed: BTreeMap<Slot, AttendanceEvent>,
}

fn slot_of(event: &AttendanceEvent) -> Slot {
    (event.timestamp, event.id.clone())
}

impl Outbox {
    pub fn new(events: Vec<AttendanceEvent>) -> Self {
        let mut outbox = Self::default();
        for event in events {
            outbox.insert(event);
        }
        outbox
    }

    pub fn insert(&mut self, event: AttendanceEvent) {
        let slot = slot_of(&event);
        if event.is_active() {
            self.by_key.entry(event.key()).or_insert_with(|| slot.clone());
            self.active.insert(slot, event);
        } else if event.status == EventStatus::Failed {
            self.failed.insert(slot, event);
        }
    }

    /// The active event for a student in a session, if any
    pub fn find(&self, key: &EventKey) -> Option<&AttendanceEvent> {
        self.by_key.get(key).and_then(|slot| self.active.get(slot))
    }

    pub fn get_mut(&mut self, slot: &Slot) -> Option<&mut AttendanceEvent> {
        self.active.get_mut(slot)
    }

    /// Oldest pending event that can be attempted at `now`. Events waiting
    /// for a later retry are skipped, not waited for.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<Slot> {
        self.active
            .iter()
            .find(|(_, event)| event.status == EventStatus::Pending && event.next_retry_at <= now)
            .map(|(slot, _)| slot.clone())
    }

    /// Make every pending event due at `now`, returning the ones that changed
    pub fn expedite(&mut self, now: DateTime<Utc>) -> Vec<AttendanceEvent> {
        self.active
            .values_mut()
            .filter(|event| event.status == EventStatus::Pending && event.next_retry_at > now)
            .map(|event| {
                event.next_retry_at = now;
                event.clone()
            })
            .collect()
    }

    /// Take an active event out of the outbox
    pub fn remove(&mut self, slot: &Slot) -> Option<AttendanceEvent> {
        let event = self.active.remove(slot)?;
        let key = event.key();
        if self.by_key.get(&key) == Some(slot) {
            self.by_key.remove(&key);
        }
        Some(event)
    }

    /// Move an event to the failed set where it is no longer scheduled
    pub fn fail(&mut self, slot: &Slot) {
        if let Some(event) = self.remove(slot) {
            self.failed.insert(slot.clone(), event);
        }
    }

    pub fn failed(&self) -> Vec<AttendanceEvent> {
        self.failed.values().cloned().collect()
    }

    pub fn take_failed(&mut self) -> Vec<AttendanceEvent> {
        std::mem::take(&mut self.failed).into_values().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.active.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::types::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
}

// IMPORTANT: events are persisted as they are. Changes to this struct
// must keep older documents readable, otherwise undelivered attendance
// is lost on the next boot.

/// A single attendance record waiting for delivery
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub student_token: String,
    pub timestamp: DateTime<Utc>,

    /// Session active at capture time. Never changes afterwards.
    pub session_id: Option<String>,

    pub status: EventStatus,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AttendanceEvent {
    pub fn new(student_token: String, timestamp: DateTime<Utc>, session_id: Option<String>) -> Self {
        Self {
            id: Uuid::default(),
            student_token,
            timestamp,
            session_id,
            status: EventStatus::Pending,
            attempts: 0,
            next_retry_at: timestamp,
            last_error: None,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            student_token: self.student_token.clone(),
            session_id: self.session_id.clone(),
        }
    }

    /// Pending and in-flight events still count towards deduplication
    pub fn is_active(&self) -> bool {
        matches!(self.status, EventStatus::Pending | EventStatus::InFlight)
    }
}

/// Natural key of an attendance record. Only one active event may exist
/// per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub student_token: String,
    pub session_id: Option<String>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureOutcome {
    /// A new event was added to the outbox
    Captured,

    /// An active event for the same student and session already existed
    Collapsed,
}

/// Result of handing an attendance record to the pipeline
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    /// Id of the event that will carry the record
    pub id: Uuid,
    pub outcome: CaptureOutcome,
    pub session_id: Option<String>,
}

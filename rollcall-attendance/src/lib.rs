/*
This crate takes care of attendance events from the moment a student is
seen by the device until the server acknowledges the record.

Events are kept in a durable outbox and delivered in capture order, with
exponential backoff between attempts. Each status change is written to
disk before moving on, so a restart at any point never loses track of
an event.
*/

mod backoff;
mod client;
mod config;
mod model;
mod outbox;
mod pipeline;
mod store;

pub use client::AttendanceClient;
pub use config::SubmissionConfig;
pub use model::{AttendanceEvent, Capture, CaptureOutcome, EventKey, EventStatus};
pub use pipeline::{Command, Pipeline, PipelineClosed, PipelineHandle, Submitter, start_submit};
pub use store::{PersistedState, StateStore, start_session_store};

use rollcall_remote as remote;
use rollcall_util as util;

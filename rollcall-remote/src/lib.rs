/*
This crate is home to everything related to the attendance server that
this device reports to.

It keeps the network link supervised, announces the device liveness,
tracks which course session is currently active for the device location
and provides the request primitives used to deliver attendance records,
all while tolerating an unreliable network.
*/

mod config;
mod heartbeat;
mod identity;
mod link;
mod registration;
mod request;
mod session;

pub use config::{LinkConfig, RemoteConfig, RequestConfig};
pub use heartbeat::{Backlog, HeartbeatRecord, start_heartbeat};
pub use identity::DeviceIdentity;
pub use link::{
    ConnectivityManager, LinkError, LinkCheck, LinkState, LinkStatus, TcpCheck, start_link,
};
pub use registration::{RegistrationError, register};
pub use request::{Endpoint, RequestError, RequestMetrics};
pub use session::{PollRequest, SessionContext, fetch_session, start_poll};

use rollcall_util as util;

use serde::{Deserialize, Serialize};

use crate::util::types::DeviceId;

// IMPORTANT: be careful making changes to this struct. It is persisted
// to disk and failure to deserialize it stops the agent at startup, until
// the stored document is fixed or removed. Any new field needs a serde
// default.

/// Identity of this device as registered with the attendance server
///
/// Loaded once at startup and never modified while the agent runs.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub display_name: String,
    pub location: String,

    /// Whether the device registration call already succeeded
    #[serde(default)]
    pub registered: bool,
}

impl DeviceIdentity {
    /// Key of the identity document in the state store
    pub const fn kind() -> &'static str {
        "identity"
    }
}

use std::time::Duration;

use crate::media::MediaConstraints;

/// Settings for one call manager.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Name sent to the remote party with `call:start`.
    pub display_name: String,
    pub constraints: MediaConstraints,
    /// Bound on ringing, outgoing after `call:start` and incoming before
    /// accept. `None` rings forever.
    pub ring_timeout: Option<Duration>,
    /// Bound on peer channel negotiation once both sides agreed to connect.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            constraints: MediaConstraints::default(),
            ring_timeout: None,
            negotiation_timeout: None,
        }
    }
}

impl CallConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = Some(timeout);
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }
}

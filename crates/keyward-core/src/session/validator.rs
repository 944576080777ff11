use std::sync::Arc;

use chrono::Duration;
use tracing::warn;

use super::model::{InvalidReason, SessionMetadata};
use crate::auth::DeviceIdentity;
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid(InvalidReason),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }

    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            Validity::Valid => None,
            Validity::Invalid(reason) => Some(*reason),
        }
    }
}

/// Decides whether a persisted session may still authorize requests.
///
/// Checks run in a fixed order and stop at the first failure: absolute
/// expiry, then device binding, then inactivity.
pub struct SessionValidator {
    identity: Arc<DeviceIdentity>,
    clock: Arc<dyn Clock>,
    max_inactivity: Duration,
}

impl SessionValidator {
    pub fn new(identity: Arc<DeviceIdentity>, clock: Arc<dyn Clock>, max_inactivity: Duration) -> Self {
        Self {
            identity,
            clock,
            max_inactivity,
        }
    }

    pub fn validate(&self, session: &SessionMetadata) -> Validity {
        let now = self.clock.now();

        if now > session.expires_at {
            return Validity::Invalid(InvalidReason::Expired);
        }

        match self.identity.fingerprint() {
            Ok(current) if current == session.device_fingerprint => {}
            Ok(_) => return Validity::Invalid(InvalidReason::FingerprintMismatch),
            Err(e) => {
                warn!(error = %e, "Could not read device fingerprint; treating as mismatch");
                return Validity::Invalid(InvalidReason::FingerprintMismatch);
            }
        }

        if now - session.last_activity_at > self.max_inactivity {
            return Validity::Invalid(InvalidReason::Inactive);
        }

        Validity::Valid
    }
}

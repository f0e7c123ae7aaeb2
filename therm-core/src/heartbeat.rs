//! Liveness check for the Tool's link to the Suite.
//!
//! Only the local connected flag is observed; no heartbeat traffic is sent. A half-open
//! connection whose local socket still reports connected is not detected.

use std::time::Duration;

use crate::connection::ConnectionState;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Not armed; nothing checked.
    Idle,
    Alive,
    /// Link found down. Reported once per arm.
    Failed,
}

#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    armed: bool,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call when the connection is established.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// One periodic check. A failure disarms the monitor until the next `arm`.
    pub fn check(&mut self, observed: ConnectionState) -> HeartbeatOutcome {
        if !self.armed {
            return HeartbeatOutcome::Idle;
        }
        if observed == ConnectionState::Connected {
            HeartbeatOutcome::Alive
        } else {
            self.armed = false;
            HeartbeatOutcome::Failed
        }
    }
}

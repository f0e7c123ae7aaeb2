//! Per-endpoint connection state. The host owns the socket; this tracks what it may do with it.

use std::fmt;

/// Which peer a link talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Device,
    Tool,
    Suite,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Device => "device",
            Self::Tool => "tool",
            Self::Suite => "suite",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{peer}: cannot {action} while {state:?}")]
pub struct StateError {
    pub peer: Peer,
    pub state: ConnectionState,
    pub action: &'static str,
}

/// Connection state of one peer.
#[derive(Debug, Clone)]
pub struct Endpoint {
    peer: Peer,
    state: ConnectionState,
}

impl Endpoint {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Start (or explicitly restart after failure) a connection attempt.
    pub fn begin_connect(&mut self) -> Result<(), StateError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            state => Err(StateError {
                peer: self.peer,
                state,
                action: "connect",
            }),
        }
    }

    pub fn mark_connected(&mut self) -> Result<(), StateError> {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            state => Err(StateError {
                peer: self.peer,
                state,
                action: "complete connection",
            }),
        }
    }

    /// Inbound accept: any non-connected state goes straight to Connected.
    pub fn mark_accepted(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Returns true only on the transition into Failed, so a failure is reported once.
    pub fn mark_failed(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state = ConnectionState::Failed;
                true
            }
            ConnectionState::Disconnected | ConnectionState::Failed => false,
        }
    }
}

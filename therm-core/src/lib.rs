//! Thermal illusion suite coordination: framing, messages and the trial state machines.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod connection;
pub mod heartbeat;
pub mod protocol;
pub mod stimulus;
pub mod suite;
pub mod timer;
pub mod tool;
pub mod trial;
pub mod wire;

pub use connection::{ConnectionState, Endpoint, Peer, StateError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatOutcome, HEARTBEAT_INTERVAL};
pub use protocol::{Message, ProtocolError, SuiteMessage, ToolCommand};
pub use stimulus::{build_stimulus_command, LookupError, StimulusCommand, VoltageMap, VoltageTable};
pub use suite::{ResponseRow, SuiteAction, SuiteCore, SuitePhase, SuiteSettings, SuiteTimer, TrialError};
pub use timer::Timers;
pub use tool::{FlowError, ToolAction, ToolCore, ToolPhase, ToolTimer};
pub use trial::{Illusion, IllusionKind, TrialFactors, TrialResponse, TrialSet, TrialSetError};
pub use wire::{encode_frame, FrameDecodeError, FrameDecoder, FrameEncodeError};

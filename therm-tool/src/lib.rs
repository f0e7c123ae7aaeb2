//! Therm tool: participant response capture. Waits for the Suite's trial start, asks
//! the questions in order and reports the answers back.

pub mod config;
pub mod session;

pub use config::{ConfigError, ToolConfig};
pub use session::{ParticipantInput, ToolNotice, ToolSession};

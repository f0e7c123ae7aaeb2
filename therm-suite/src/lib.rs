//! Therm suite: experiment orchestrator. Connects to the stimulus device, accepts the
//! participant tool, sequences trials and appends responses to the study folder.

pub mod config;
pub mod session;
pub mod study;

pub use config::{ConfigError, SuiteConfig};
pub use session::{CommandError, OperatorCommand, StatusReport, SuiteNotice, SuiteSession};
pub use study::{LoadError, StudyFolder};

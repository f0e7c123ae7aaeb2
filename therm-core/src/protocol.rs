//! Text message model carried inside frames.
//!
//! Suite-to-Tool control commands carry a leading `$` (`$trialstart,7,3,1500`);
//! Tool-to-Suite messages do not (`nexttrial`, `response,7,3,...`).

use std::fmt;
use std::time::Duration;

/// Leading marker of Suite-to-Tool control commands.
pub const CONTROL_MARKER: char = '$';

pub const CMD_TRIAL_START: &str = "trialstart";
pub const CMD_EXPERIMENT_END: &str = "experimentend";
pub const CMD_NEXT_TRIAL: &str = "nexttrial";
pub const CMD_RESPONSE: &str = "response";

/// One decoded message: command plus positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub control: bool,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn control(command: &str, params: Vec<String>) -> Self {
        Self {
            control: true,
            command: command.to_string(),
            params,
        }
    }

    pub fn report(command: &str, params: Vec<String>) -> Self {
        Self {
            control: false,
            command: command.to_string(),
            params,
        }
    }

    /// Split a decoded frame on commas. Never fails; an empty text gives an empty command.
    pub fn parse(text: &str) -> Self {
        let (control, body) = match text.strip_prefix(CONTROL_MARKER) {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let mut fields = body.split(',');
        let command = fields.next().unwrap_or_default().trim().to_string();
        let params = fields.map(str::to_string).collect();
        Self {
            control,
            command,
            params,
        }
    }

    /// Positional parameter; missing trailing parameters read as "".
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    /// Parameters padded with "" (or truncated) to exactly `len` entries.
    pub fn padded_params(&self, len: usize) -> Vec<String> {
        (0..len).map(|i| self.param(i).to_string()).collect()
    }

    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if self.control {
            out.push(CONTROL_MARKER);
        }
        out.push_str(&self.command);
        for p in &self.params {
            out.push(',');
            out.push_str(p);
        }
        out
    }

    fn numeric<T: std::str::FromStr>(&self, index: usize, name: &'static str) -> Result<T, ProtocolError> {
        let raw = self.param(index).trim();
        if raw.is_empty() {
            return Err(ProtocolError::MissingField(name));
        }
        raw.parse().map_err(|_| ProtocolError::BadNumber {
            field: name,
            value: raw.to_string(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Error interpreting a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} is not a number: {value:?}")]
    BadNumber { field: &'static str, value: String },
}

/// Commands the Suite sends to the Tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    TrialStart {
        participant: u32,
        trial: u32,
        wait: Duration,
    },
    ExperimentEnd,
}

impl ToolCommand {
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        if !msg.control {
            return Err(ProtocolError::UnknownCommand(msg.command.clone()));
        }
        match msg.command.as_str() {
            CMD_TRIAL_START => {
                let participant = msg.numeric(0, "participantNumber")?;
                let trial = msg.numeric(1, "trialNumber")?;
                let wait_ms: f64 = msg.numeric(2, "waitMs")?;
                if !wait_ms.is_finite() || wait_ms < 0.0 {
                    return Err(ProtocolError::BadNumber {
                        field: "waitMs",
                        value: msg.param(2).to_string(),
                    });
                }
                Ok(Self::TrialStart {
                    participant,
                    trial,
                    wait: Duration::from_millis(wait_ms.round() as u64),
                })
            }
            CMD_EXPERIMENT_END => Ok(Self::ExperimentEnd),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn to_message(&self) -> Message {
        match self {
            Self::TrialStart {
                participant,
                trial,
                wait,
            } => Message::control(
                CMD_TRIAL_START,
                vec![
                    participant.to_string(),
                    trial.to_string(),
                    wait.as_millis().to_string(),
                ],
            ),
            Self::ExperimentEnd => Message::control(CMD_EXPERIMENT_END, vec![]),
        }
    }
}

/// Messages the Tool sends to the Suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteMessage {
    NextTrial,
    /// Participant, trial and the raw answer fields. Field count is not checked here.
    Response {
        participant: u32,
        trial: u32,
        fields: Vec<String>,
    },
}

impl SuiteMessage {
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        if msg.control {
            return Err(ProtocolError::UnknownCommand(msg.to_wire()));
        }
        match msg.command.as_str() {
            CMD_NEXT_TRIAL => Ok(Self::NextTrial),
            CMD_RESPONSE => Ok(Self::Response {
                participant: msg.numeric(0, "participantNumber")?,
                trial: msg.numeric(1, "trialNumber")?,
                fields: msg.params.iter().skip(2).cloned().collect(),
            }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn to_message(&self) -> Message {
        match self {
            Self::NextTrial => Message::report(CMD_NEXT_TRIAL, vec![]),
            Self::Response {
                participant,
                trial,
                fields,
            } => {
                let mut params = vec![participant.to_string(), trial.to_string()];
                params.extend(fields.iter().cloned());
                Message::report(CMD_RESPONSE, params)
            }
        }
    }
}

//! Suite-side trial sequencing. Host-driven: the host passes operator requests, Tool
//! messages and elapsed timers; the core returns actions for the host to perform.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::protocol::{Message, ProtocolError, SuiteMessage, ToolCommand};
use crate::stimulus::{build_stimulus_command, LookupError, VoltageTable};
use crate::trial::{IllusionKind, TrialFactors, TrialResponse, TrialSet};

/// Minimum time between two `play_trial` calls.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Wait added to the stimulus duration before the Tool asks questions (lead-in + settle).
pub const DEFAULT_TRIAL_OVERHEAD: Duration = Duration::from_millis(3750);

#[derive(Debug, Clone)]
pub struct SuiteSettings {
    pub illusion: IllusionKind,
    pub base_temperature: i32,
    pub override_hot_voltage: Option<f32>,
    pub trial_overhead: Duration,
    pub cooldown: Duration,
    pub auto_advance: bool,
}

impl Default for SuiteSettings {
    fn default() -> Self {
        Self {
            illusion: IllusionKind::Funneling,
            base_temperature: 0,
            override_hot_voltage: None,
            trial_overhead: DEFAULT_TRIAL_OVERHEAD,
            cooldown: DEFAULT_COOLDOWN,
            auto_advance: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuitePhase {
    /// No trial set loaded yet.
    Unloaded,
    Idle,
    TrialRunning,
    AwaitingResponses,
    TrialComplete,
    ExperimentEnded,
}

impl SuitePhase {
    pub fn trial_in_flight(self) -> bool {
        matches!(self, Self::TrialRunning | Self::AwaitingResponses)
    }
}

impl fmt::Display for SuitePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Deferred transitions the host schedules and hands back through `on_timer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteTimer {
    AwaitResponses { trial: u32 },
    AutoPlay,
}

/// One persisted response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRow {
    pub participant: u32,
    pub trial: u32,
    pub columns: &'static [&'static str],
    pub values: Vec<String>,
}

impl ResponseRow {
    pub fn header(&self) -> String {
        let mut out = String::from("participantNumber,trialNumber");
        for c in self.columns {
            out.push(',');
            out.push_str(c);
        }
        out
    }

    pub fn to_csv_line(&self) -> String {
        let mut out = format!("{},{}", self.participant, self.trial);
        for v in &self.values {
            out.push(',');
            out.push_str(v);
        }
        out
    }
}

/// Action for the host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SuiteAction {
    SendToDevice(String),
    SendToTool(Message),
    Schedule { after: Duration, timer: SuiteTimer },
    Persist(ResponseRow),
    TrialStarted { participant: u32, trial: u32 },
    ExperimentEnded { participant: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("no trial set loaded")]
    NoTrialSet,
    #[error("a trial is already active ({0})")]
    Busy(SuitePhase),
    #[error("trial set already completed")]
    Ended,
    #[error("cooldown: {remaining:?} left")]
    Cooldown { remaining: Duration },
    #[error("voltage lookup failed: {0}")]
    Lookup(#[from] LookupError),
    #[error("stimulus encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bad message from tool: {0}")]
    Parse(#[from] ProtocolError),
    #[error("response for p{got_participant} trial {got_trial} does not match active trial")]
    UnexpectedResponse { got_participant: u32, got_trial: u32 },
}

/// Suite trial state machine.
pub struct SuiteCore {
    settings: SuiteSettings,
    table: Box<dyn VoltageTable + Send>,
    phase: SuitePhase,
    trial_set: Option<TrialSet>,
    index: usize,
    current: Option<TrialResponse>,
    cooldown_until: Option<Instant>,
    autoplay_pending: bool,
}

impl SuiteCore {
    pub fn new(settings: SuiteSettings, table: impl VoltageTable + Send + 'static) -> Self {
        Self {
            settings,
            table: Box::new(table),
            phase: SuitePhase::Unloaded,
            trial_set: None,
            index: 0,
            current: None,
            cooldown_until: None,
            autoplay_pending: false,
        }
    }

    pub fn settings(&self) -> &SuiteSettings {
        &self.settings
    }

    pub fn set_auto_advance(&mut self, enabled: bool) {
        self.settings.auto_advance = enabled;
    }

    pub fn phase(&self) -> SuitePhase {
        self.phase
    }

    /// Zero-based index of the next (or running) trial.
    pub fn trial_index(&self) -> usize {
        self.index
    }

    pub fn trial_set(&self) -> Option<&TrialSet> {
        self.trial_set.as_ref()
    }

    pub fn participant(&self) -> Option<u32> {
        self.trial_set.as_ref().map(TrialSet::participant)
    }

    /// Factors of the next (or running) trial.
    pub fn current_factors(&self) -> Option<&TrialFactors> {
        self.trial_set.as_ref()?.get(self.index)
    }

    /// Install a participant's trial set. Any trial in flight is abandoned.
    pub fn start_trial_set(&mut self, set: TrialSet) {
        if self.phase.trial_in_flight() {
            self.abandon_trial("trial set replaced");
        }
        info!(participant = set.participant(), trials = set.len(), "trial set loaded");
        self.trial_set = Some(set);
        self.index = 0;
        self.current = None;
        self.autoplay_pending = false;
        self.phase = SuitePhase::Idle;
    }

    /// Time the Tool waits before asking questions.
    pub fn total_wait(&self, factors: &TrialFactors) -> Duration {
        self.settings.trial_overhead
            + Duration::try_from_secs_f32(factors.duration).unwrap_or_default()
    }

    /// Start the current trial. On error nothing has been sent and the phase is unchanged.
    pub fn play_trial(&mut self, now: Instant) -> Result<Vec<SuiteAction>, TrialError> {
        match self.phase {
            SuitePhase::Idle => {}
            SuitePhase::Unloaded => return Err(TrialError::NoTrialSet),
            SuitePhase::ExperimentEnded => return Err(TrialError::Ended),
            phase => return Err(TrialError::Busy(phase)),
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(TrialError::Cooldown {
                    remaining: until - now,
                });
            }
        }
        let set = self.trial_set.as_ref().ok_or(TrialError::NoTrialSet)?;
        let participant = set.participant();
        let factors = set.get(self.index).ok_or(TrialError::Ended)?;
        let stimulus = build_stimulus_command(
            factors,
            self.settings.base_temperature,
            self.settings.override_hot_voltage,
            &*self.table,
        )?;
        let json = stimulus.to_json()?;
        let wait = self.total_wait(factors);
        let trial = self.index as u32 + 1;
        info!(participant, trial, factors = %factors, ?wait, "playing trial");

        self.current = Some(TrialResponse::new(participant, trial));
        self.phase = SuitePhase::TrialRunning;
        self.cooldown_until = Some(now + self.settings.cooldown);
        let start = ToolCommand::TrialStart {
            participant,
            trial,
            wait,
        };
        Ok(vec![
            SuiteAction::SendToDevice(json),
            SuiteAction::SendToTool(start.to_message()),
            SuiteAction::Schedule {
                after: wait,
                timer: SuiteTimer::AwaitResponses { trial },
            },
            SuiteAction::TrialStarted { participant, trial },
        ])
    }

    /// Device JSON for a one-off stimulus outside the trial sequence.
    pub fn test_stimulus(&self, factors: &TrialFactors) -> Result<String, TrialError> {
        let stimulus = build_stimulus_command(
            factors,
            self.settings.base_temperature,
            self.settings.override_hot_voltage,
            &*self.table,
        )?;
        Ok(stimulus.to_json()?)
    }

    pub fn on_timer(&mut self, timer: SuiteTimer, now: Instant) -> Result<Vec<SuiteAction>, TrialError> {
        match timer {
            SuiteTimer::AwaitResponses { trial } => {
                let running = self.current.as_ref().map(|r| r.trial);
                if self.phase == SuitePhase::TrialRunning && running == Some(trial) {
                    debug!(trial, "awaiting responses");
                    self.phase = SuitePhase::AwaitingResponses;
                } else {
                    debug!(trial, phase = %self.phase, "stale await timer");
                }
                Ok(vec![])
            }
            SuiteTimer::AutoPlay => {
                self.autoplay_pending = false;
                if self.settings.auto_advance && self.phase == SuitePhase::Idle {
                    self.play_trial(now)
                } else {
                    Ok(vec![])
                }
            }
        }
    }

    pub fn on_tool_message(&mut self, msg: &Message, now: Instant) -> Result<Vec<SuiteAction>, TrialError> {
        let parsed = match SuiteMessage::from_message(msg) {
            Ok(m) => m,
            Err(e @ ProtocolError::UnknownCommand(_)) => return Err(e.into()),
            Err(e) => {
                if self.phase.trial_in_flight() {
                    self.abandon_trial("malformed response");
                }
                return Err(e.into());
            }
        };
        match parsed {
            SuiteMessage::NextTrial => self.on_next_trial(now),
            SuiteMessage::Response {
                participant,
                trial,
                fields,
            } => self.on_response(participant, trial, fields),
        }
    }

    fn on_next_trial(&mut self, now: Instant) -> Result<Vec<SuiteAction>, TrialError> {
        if !self.settings.auto_advance || self.phase != SuitePhase::Idle {
            debug!(phase = %self.phase, "tool ready for next trial");
            return Ok(vec![]);
        }
        match self.play_trial(now) {
            Err(TrialError::Cooldown { remaining }) => {
                if self.autoplay_pending {
                    return Ok(vec![]);
                }
                self.autoplay_pending = true;
                Ok(vec![SuiteAction::Schedule {
                    after: remaining,
                    timer: SuiteTimer::AutoPlay,
                }])
            }
            other => other,
        }
    }

    fn on_response(
        &mut self,
        participant: u32,
        trial: u32,
        fields: Vec<String>,
    ) -> Result<Vec<SuiteAction>, TrialError> {
        let matches = self.phase.trial_in_flight()
            && self
                .current
                .as_ref()
                .is_some_and(|r| r.participant == participant && r.trial == trial);
        if !matches {
            return Err(TrialError::UnexpectedResponse {
                got_participant: participant,
                got_trial: trial,
            });
        }
        let Some(mut response) = self.current.take() else {
            return Err(TrialError::UnexpectedResponse {
                got_participant: participant,
                got_trial: trial,
            });
        };
        let columns = self.settings.illusion.response_columns();
        response.responses = fields;
        response.pad_to(columns.len());
        self.phase = SuitePhase::TrialComplete;
        info!(participant, trial, answers = ?response.responses, "trial complete");

        Ok(vec![SuiteAction::Persist(ResponseRow {
            participant,
            trial,
            columns,
            values: response.responses,
        })])
    }

    /// Outcome of the last `Persist`. Only a saved row moves the index; a failed write
    /// abandons the trial so it can be played again.
    pub fn on_persisted(&mut self, saved: bool) -> Vec<SuiteAction> {
        if self.phase != SuitePhase::TrialComplete {
            debug!(phase = %self.phase, "persist outcome without completed trial");
            return vec![];
        }
        if !saved {
            warn!(trial = self.index + 1, "response not saved, trial abandoned");
            self.phase = SuitePhase::Idle;
            return vec![];
        }
        self.index += 1;
        let total = self.trial_set.as_ref().map_or(0, TrialSet::len);
        if self.index >= total {
            let participant = self.participant().unwrap_or_default();
            info!(participant, "### completed trial set ###");
            self.phase = SuitePhase::ExperimentEnded;
            vec![
                SuiteAction::SendToTool(ToolCommand::ExperimentEnd.to_message()),
                SuiteAction::ExperimentEnded { participant },
            ]
        } else {
            self.phase = SuitePhase::Idle;
            vec![]
        }
    }

    /// Drop the trial in flight without advancing. Returns false when none was active.
    pub fn abandon_trial(&mut self, reason: &str) -> bool {
        if !self.phase.trial_in_flight() {
            return false;
        }
        let trial = self.current.take().map(|r| r.trial);
        warn!(?trial, reason, "trial abandoned");
        self.phase = SuitePhase::Idle;
        true
    }
}

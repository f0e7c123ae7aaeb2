//! Tool-side response flow: wait out the stimulus, ask each question in order, report back.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::{Message, ProtocolError, SuiteMessage, ToolCommand};
use crate::trial::{IllusionKind, TrialResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Idle,
    /// Stimulus playing; questions not shown yet.
    Waiting { trial: u32 },
    /// Question index currently shown.
    Collecting(usize),
    Sending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTimer {
    ResponsesDue { trial: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    SendToSuite(Message),
    Schedule { after: Duration, timer: ToolTimer },
    TrialStarted { participant: u32, trial: u32 },
    AskQuestion { index: usize, total: usize },
    TrialFinished { participant: u32, trial: u32 },
    ExperimentEnded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("no question is open ({0:?})")]
    NotCollecting(ToolPhase),
}

pub struct ToolCore {
    kind: IllusionKind,
    phase: ToolPhase,
    current: Option<TrialResponse>,
}

impl ToolCore {
    pub fn new(kind: IllusionKind) -> Self {
        Self {
            kind,
            phase: ToolPhase::Idle,
            current: None,
        }
    }

    pub fn kind(&self) -> IllusionKind {
        self.kind
    }

    pub fn phase(&self) -> ToolPhase {
        self.phase
    }

    /// Participant and trial of the live response, if any.
    pub fn current_trial(&self) -> Option<(u32, u32)> {
        self.current.as_ref().map(|r| (r.participant, r.trial))
    }

    /// Answers recorded so far for the live trial.
    pub fn answers(&self) -> &[String] {
        self.current
            .as_ref()
            .map(|r| r.responses.as_slice())
            .unwrap_or(&[])
    }

    pub fn on_suite_message(&mut self, msg: &Message) -> Result<Vec<ToolAction>, ProtocolError> {
        match ToolCommand::from_message(msg)? {
            ToolCommand::TrialStart {
                participant,
                trial,
                wait,
            } => {
                if let Some((p, t)) = self.current_trial() {
                    warn!(participant = p, trial = t, "trial replaced by a new trial start");
                }
                info!(participant, trial, ?wait, "trial started");
                self.current = Some(TrialResponse::new(participant, trial));
                self.phase = ToolPhase::Waiting { trial };
                Ok(vec![
                    ToolAction::Schedule {
                        after: wait,
                        timer: ToolTimer::ResponsesDue { trial },
                    },
                    ToolAction::TrialStarted { participant, trial },
                ])
            }
            ToolCommand::ExperimentEnd => {
                if let Some((participant, trial)) = self.current_trial() {
                    warn!(participant, trial, "experiment ended with a trial open");
                }
                info!("experiment ended");
                self.current = None;
                self.phase = ToolPhase::Idle;
                Ok(vec![ToolAction::ExperimentEnded])
            }
        }
    }

    pub fn on_timer(&mut self, timer: ToolTimer) -> Vec<ToolAction> {
        match timer {
            ToolTimer::ResponsesDue { trial } => {
                if self.phase != (ToolPhase::Waiting { trial }) {
                    debug!(trial, phase = ?self.phase, "stale responses timer");
                    return vec![];
                }
                self.phase = ToolPhase::Collecting(0);
                vec![self.ask(0)]
            }
        }
    }

    /// Record the answer to the open question.
    pub fn record_response(&mut self, value: impl Into<String>) -> Result<Vec<ToolAction>, FlowError> {
        let ToolPhase::Collecting(index) = self.phase else {
            return Err(FlowError::NotCollecting(self.phase));
        };
        let Some(response) = self.current.as_mut() else {
            return Err(FlowError::NotCollecting(self.phase));
        };
        response.record(value);
        let next = index + 1;
        if next < self.kind.question_count() {
            self.phase = ToolPhase::Collecting(next);
            return Ok(vec![self.ask(next)]);
        }
        Ok(self.finish())
    }

    /// Leave the remaining answers blank except the last, which is asked next.
    pub fn skip_rest(&mut self) -> Result<Vec<ToolAction>, FlowError> {
        let ToolPhase::Collecting(index) = self.phase else {
            return Err(FlowError::NotCollecting(self.phase));
        };
        let Some(response) = self.current.as_mut() else {
            return Err(FlowError::NotCollecting(self.phase));
        };
        let last = self.kind.question_count().saturating_sub(1);
        if index >= last {
            return Ok(vec![]);
        }
        response.pad_to(last);
        debug!(from = index, to = last, "skipped questions");
        self.phase = ToolPhase::Collecting(last);
        Ok(vec![self.ask(last)])
    }

    /// The participant is ready for another trial.
    pub fn next_trial(&self) -> Vec<ToolAction> {
        vec![ToolAction::SendToSuite(SuiteMessage::NextTrial.to_message())]
    }

    /// Drop the live trial, e.g. when the Suite link is lost.
    pub fn reset(&mut self) {
        if let Some((participant, trial)) = self.current_trial() {
            warn!(participant, trial, "trial dropped");
        }
        self.current = None;
        self.phase = ToolPhase::Idle;
    }

    fn ask(&self, index: usize) -> ToolAction {
        ToolAction::AskQuestion {
            index,
            total: self.kind.question_count(),
        }
    }

    fn finish(&mut self) -> Vec<ToolAction> {
        self.phase = ToolPhase::Sending;
        let mut actions = Vec::with_capacity(2);
        if let Some(mut response) = self.current.take() {
            response.pad_to(self.kind.question_count());
            let (participant, trial) = (response.participant, response.trial);
            info!(participant, trial, answers = ?response.responses, "sending responses");
            actions.push(ToolAction::SendToSuite(response.into_report().to_message()));
            actions.push(ToolAction::TrialFinished { participant, trial });
        }
        self.phase = ToolPhase::Idle;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(kind: IllusionKind) -> ToolCore {
        let mut core = ToolCore::new(kind);
        core.on_suite_message(&Message::parse("$trialstart,1,1,2000")).unwrap();
        core.on_timer(ToolTimer::ResponsesDue { trial: 1 });
        core
    }

    #[test]
    fn trial_start_schedules_questions() {
        let mut core = ToolCore::new(IllusionKind::Funneling);
        let actions = core
            .on_suite_message(&Message::parse("$trialstart,1,1,2000"))
            .unwrap();
        assert_eq!(
            actions[0],
            ToolAction::Schedule {
                after: Duration::from_millis(2000),
                timer: ToolTimer::ResponsesDue { trial: 1 },
            }
        );
        assert_eq!(core.phase(), ToolPhase::Waiting { trial: 1 });

        let actions = core.on_timer(ToolTimer::ResponsesDue { trial: 1 });
        assert_eq!(actions, vec![ToolAction::AskQuestion { index: 0, total: 2 }]);
        assert_eq!(core.phase(), ToolPhase::Collecting(0));
    }

    #[test]
    fn answers_are_sent_in_order() {
        let mut core = started(IllusionKind::Funneling);
        assert_eq!(
            core.record_response("3").unwrap(),
            vec![ToolAction::AskQuestion { index: 1, total: 2 }]
        );
        let actions = core.record_response("yes").unwrap();
        match &actions[0] {
            ToolAction::SendToSuite(msg) => assert_eq!(msg.to_wire(), "response,1,1,3,yes"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(actions[1], ToolAction::TrialFinished { participant: 1, trial: 1 });
        assert_eq!(core.phase(), ToolPhase::Idle);
        assert_eq!(core.current_trial(), None);
    }

    #[test]
    fn skip_jumps_to_last_question() {
        let mut core = started(IllusionKind::Motion);
        assert_eq!(
            core.skip_rest().unwrap(),
            vec![ToolAction::AskQuestion { index: 2, total: 3 }]
        );
        assert_eq!(core.answers(), ["", ""]);
        let actions = core.record_response("left").unwrap();
        assert!(matches!(&actions[0], ToolAction::SendToSuite(m) if m.to_wire() == "response,1,1,,,left"));
    }

    #[test]
    fn skip_on_last_question_is_noop() {
        let mut core = started(IllusionKind::Funneling);
        core.record_response("1").unwrap();
        assert!(core.skip_rest().unwrap().is_empty());
        assert_eq!(core.phase(), ToolPhase::Collecting(1));
    }

    #[test]
    fn answer_outside_collecting_fails() {
        let mut core = ToolCore::new(IllusionKind::Baseline);
        assert_eq!(
            core.record_response("x"),
            Err(FlowError::NotCollecting(ToolPhase::Idle))
        );
        core.on_suite_message(&Message::parse("$trialstart,2,4,10")).unwrap();
        assert!(core.skip_rest().is_err());
    }

    #[test]
    fn stale_timer_is_ignored() {
        let mut core = ToolCore::new(IllusionKind::Funneling);
        core.on_suite_message(&Message::parse("$trialstart,1,1,2000")).unwrap();
        core.on_suite_message(&Message::parse("$trialstart,1,2,2000")).unwrap();
        assert!(core.on_timer(ToolTimer::ResponsesDue { trial: 1 }).is_empty());
        assert_eq!(core.phase(), ToolPhase::Waiting { trial: 2 });
        assert_eq!(core.current_trial(), Some((1, 2)));
    }

    #[test]
    fn experiment_end_drops_trial() {
        let mut core = started(IllusionKind::Funneling);
        core.record_response("1").unwrap();
        let actions = core.on_suite_message(&Message::parse("$experimentend")).unwrap();
        assert_eq!(actions, vec![ToolAction::ExperimentEnded]);
        assert_eq!(core.phase(), ToolPhase::Idle);
        assert!(core.answers().is_empty());
    }

    #[test]
    fn malformed_start_keeps_phase() {
        let mut core = ToolCore::new(IllusionKind::Funneling);
        assert!(core.on_suite_message(&Message::parse("$trialstart,x,1,5")).is_err());
        assert!(core.on_suite_message(&Message::parse("$bogus")).is_err());
        assert_eq!(core.phase(), ToolPhase::Idle);
    }

    #[test]
    fn next_trial_reports_ready() {
        let core = ToolCore::new(IllusionKind::Funneling);
        assert!(matches!(
            &core.next_trial()[0],
            ToolAction::SendToSuite(m) if m.to_wire() == "nexttrial"
        ));
    }
}

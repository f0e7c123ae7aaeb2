//! Tool session loop: one task owning the response flow, the Suite link and the heartbeat.

use std::fmt;
use std::time::Instant;

use therm_core::{
    ConnectionState, Endpoint, HeartbeatMonitor, HeartbeatOutcome, Message, Peer, Timers, ToolAction,
    ToolCore, ToolTimer,
};
use therm_net::{event_channel, spawn_connect, Link, LinkEvent};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ToolConfig;

/// Participant console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantInput {
    Connect,
    Answer(String),
    /// Leave the remaining questions blank and jump to the last one.
    Skip,
    /// Ready for the next trial.
    Next,
    Quit,
}

impl ParticipantInput {
    /// Any line that is not a keyword is an answer.
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "connect" => Self::Connect,
            "skip" => Self::Skip,
            "next" => Self::Next,
            "quit" | "exit" => Self::Quit,
            answer => Self::Answer(answer.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolNotice {
    Connection(ConnectionState),
    TrialStarted { participant: u32, trial: u32 },
    Question { index: usize, total: usize, column: &'static str },
    TrialFinished { participant: u32, trial: u32 },
    ExperimentEnded,
    Error(String),
}

impl fmt::Display for ToolNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(state) => write!(f, "suite: {state:?}"),
            Self::TrialStarted { participant, trial } => {
                write!(f, "participant {participant}: trial {trial}, please wait")
            }
            Self::Question { index, total, column } => {
                write!(f, "question {}/{total} ({column}):", index + 1)
            }
            Self::TrialFinished { trial, .. } => write!(f, "trial {trial} done; type next when ready"),
            Self::ExperimentEnded => f.write_str("experiment finished, thank you"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

pub struct ToolSession {
    state: SessionState,
    events: mpsc::Receiver<LinkEvent>,
}

struct SessionState {
    config: ToolConfig,
    core: ToolCore,
    suite: Endpoint,
    link: Option<Link>,
    heartbeat: HeartbeatMonitor,
    timers: Timers<ToolTimer>,
    events_tx: mpsc::Sender<LinkEvent>,
    notices: mpsc::UnboundedSender<ToolNotice>,
}

impl ToolSession {
    pub fn new(config: ToolConfig, notices: mpsc::UnboundedSender<ToolNotice>) -> Self {
        let (events_tx, events) = event_channel();
        let state = SessionState {
            core: ToolCore::new(config.illusion),
            suite: Endpoint::new(Peer::Suite),
            link: None,
            heartbeat: HeartbeatMonitor::new(),
            timers: Timers::new(),
            events_tx,
            notices,
            config,
        };
        Self { state, events }
    }

    /// Connect to the Suite, then run until `Quit` or until the input channel closes.
    pub async fn run(self, mut input: mpsc::UnboundedReceiver<ParticipantInput>) -> anyhow::Result<()> {
        let Self {
            mut state,
            mut events,
        } = self;
        let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        state.connect();
        loop {
            let deadline = state.timers.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(LinkEvent::Opened(link)) => {
                        // First check lands one full interval after the link opens.
                        if state.on_opened(link) {
                            heartbeat.reset();
                        }
                    }
                    Some(event) => state.on_link_event(event),
                    None => break,
                },
                line = input.recv() => match line {
                    Some(ParticipantInput::Quit) | None => break,
                    Some(line) => state.on_input(line),
                },
                _ = sleep_until(deadline) => state.on_timers_due(),
                _ = heartbeat.tick() => state.on_heartbeat(),
            }
        }
        info!("tool session stopped");
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

impl SessionState {
    fn notify(&self, notice: ToolNotice) {
        let _ = self.notices.send(notice);
    }

    fn connect(&mut self) {
        if let Err(e) = self.suite.begin_connect() {
            self.notify(ToolNotice::Error(e.to_string()));
            return;
        }
        let addr = self.config.suite_addr();
        info!(%addr, "connecting to suite");
        self.notify(ToolNotice::Connection(ConnectionState::Connecting));
        spawn_connect(
            Peer::Suite,
            addr,
            self.config.connect_timeout(),
            self.events_tx.clone(),
        );
    }

    fn on_input(&mut self, input: ParticipantInput) {
        let result = match input {
            ParticipantInput::Connect => {
                self.connect();
                return;
            }
            ParticipantInput::Answer(value) => self.core.record_response(value),
            ParticipantInput::Skip => self.core.skip_rest(),
            ParticipantInput::Next => Ok(self.core.next_trial()),
            ParticipantInput::Quit => return,
        };
        match result {
            Ok(actions) => self.apply(actions),
            Err(e) => {
                debug!(error = %e, "input ignored");
                self.notify(ToolNotice::Error(e.to_string()));
            }
        }
    }

    fn apply(&mut self, actions: Vec<ToolAction>) {
        for action in actions {
            match action {
                ToolAction::SendToSuite(msg) => {
                    let sent = self.link.as_ref().map(|l| l.send(&msg.to_wire()));
                    match sent {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, %msg, "send to suite failed");
                            self.notify(ToolNotice::Error(format!("send failed: {e}")));
                        }
                        None => {
                            warn!(%msg, "not connected to suite");
                            self.notify(ToolNotice::Error("not connected to suite".into()));
                        }
                    }
                }
                ToolAction::Schedule { after, timer } => {
                    self.timers.schedule(Instant::now() + after, timer);
                }
                ToolAction::TrialStarted { participant, trial } => {
                    self.notify(ToolNotice::TrialStarted { participant, trial })
                }
                ToolAction::AskQuestion { index, total } => {
                    let column = self
                        .core
                        .kind()
                        .response_columns()
                        .get(index)
                        .copied()
                        .unwrap_or("answer");
                    self.notify(ToolNotice::Question {
                        index,
                        total,
                        column,
                    })
                }
                ToolAction::TrialFinished { participant, trial } => {
                    self.notify(ToolNotice::TrialFinished { participant, trial })
                }
                ToolAction::ExperimentEnded => self.notify(ToolNotice::ExperimentEnded),
            }
        }
    }

    fn on_timers_due(&mut self) {
        for timer in self.timers.pop_due(Instant::now()) {
            let actions = self.core.on_timer(timer);
            self.apply(actions);
        }
    }

    /// Observes only the link's local flag; no traffic is sent.
    fn on_heartbeat(&mut self) {
        let observed = match &self.link {
            Some(link) if link.is_connected() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        };
        match self.heartbeat.check(observed) {
            HeartbeatOutcome::Idle | HeartbeatOutcome::Alive => {}
            HeartbeatOutcome::Failed => {
                warn!("suite link lost");
                self.link = None;
                self.suite.mark_failed();
                self.timers = Timers::new();
                self.core.reset();
                self.notify(ToolNotice::Connection(ConnectionState::Failed));
            }
        }
    }

    /// Returns true when the link was taken and the heartbeat armed.
    fn on_opened(&mut self, link: Link) -> bool {
        if let Err(e) = self.suite.mark_connected() {
            warn!(error = %e, "unexpected suite link dropped");
            return false;
        }
        info!(link = %link.id(), addr = %link.peer_addr(), "connected to suite");
        self.link = Some(link);
        self.heartbeat.arm();
        self.notify(ToolNotice::Connection(ConnectionState::Connected));
        true
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(link) => {
                self.on_opened(link);
            }
            LinkEvent::Message { link, text, .. } => {
                if self.link.as_ref().map(Link::id) != Some(link) {
                    debug!(%link, "message from stale link ignored");
                    return;
                }
                match self.core.on_suite_message(&Message::parse(&text)) {
                    Ok(actions) => self.apply(actions),
                    Err(e) => warn!(%text, error = %e, "suite message ignored"),
                }
            }
            // The heartbeat turns a dead link into a failure on its next tick.
            LinkEvent::Closed { link, error, .. } => {
                debug!(%link, ?error, "suite link closed");
            }
            LinkEvent::ConnectFailed { error, .. } => {
                if self.suite.mark_failed() {
                    self.notify(ToolNotice::Error(error.to_string()));
                    self.notify(ToolNotice::Connection(ConnectionState::Failed));
                }
            }
        }
    }
}

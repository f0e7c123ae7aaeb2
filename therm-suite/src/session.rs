//! Suite session loop: owns the trial state machine and both links, driven by operator
//! commands, link events and timers on one task.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use therm_core::{
    ConnectionState, Endpoint, IllusionKind, Message, Peer, SuiteAction, SuiteCore, SuitePhase,
    SuiteTimer, Timers, TrialError, TrialFactors,
};
use therm_core::trial::TrialParseError;
use therm_net::{event_channel, listen, spawn_connect, Link, LinkEvent, Listener};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SuiteConfig;
use crate::study::StudyFolder;

/// Operator console requests.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    ConnectDevice,
    LoadParticipant(u32),
    Play,
    AutoAdvance(bool),
    /// One-off stimulus outside the trial sequence.
    Test(TrialFactors),
    Status,
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("bad stimulus: {0}")]
    Factors(#[from] TrialParseError),
}

impl OperatorCommand {
    /// Parse one console line. `kind` interprets the optional fourth `test` argument.
    pub fn parse(line: &str, kind: IllusionKind) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace();
        let cmd = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        match (cmd, args.as_slice()) {
            ("connect", []) => Ok(Self::ConnectDevice),
            ("participant" | "p", [n]) => n
                .parse()
                .map(Self::LoadParticipant)
                .map_err(|_| CommandError::Usage("participant <number>")),
            ("play", []) => Ok(Self::Play),
            ("auto", ["on"]) => Ok(Self::AutoAdvance(true)),
            ("auto", ["off"]) => Ok(Self::AutoAdvance(false)),
            ("auto", _) => Err(CommandError::Usage("auto on|off")),
            ("test", [_, _] | [_, _, _]) => {
                let row = format!("0,{}", args.join(","));
                Ok(Self::Test(TrialFactors::parse(kind, &row)?))
            }
            ("test", _) => Err(CommandError::Usage("test <temperature> <duration> [location|direction]")),
            ("status", []) => Ok(Self::Status),
            ("quit" | "exit", []) => Ok(Self::Quit),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub phase: SuitePhase,
    pub participant: Option<u32>,
    /// Zero-based index of the next trial.
    pub trial_index: usize,
    pub trials: usize,
    pub device: ConnectionState,
    pub tool: ConnectionState,
    pub auto_advance: bool,
}

/// Console-facing notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SuiteNotice {
    Connection { peer: Peer, state: ConnectionState },
    TrialSetLoaded { participant: u32, trials: usize },
    TrialStarted { participant: u32, trial: u32 },
    ResponseSaved { participant: u32, trial: u32, path: PathBuf },
    ExperimentEnded { participant: u32 },
    Status(StatusReport),
    Error(String),
}

impl fmt::Display for SuiteNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { peer, state } => write!(f, "{peer}: {state:?}"),
            Self::TrialSetLoaded { participant, trials } => {
                write!(f, "participant {participant}: {trials} trials loaded")
            }
            Self::TrialStarted { participant, trial } => {
                write!(f, "participant {participant}: trial {trial} started")
            }
            Self::ResponseSaved {
                participant,
                trial,
                path,
            } => write!(
                f,
                "participant {participant}: trial {trial} saved to {}",
                path.display()
            ),
            Self::ExperimentEnded { participant } => {
                write!(f, "participant {participant}: trial set completed")
            }
            Self::Status(s) => write!(
                f,
                "phase {} | participant {} | next trial {}/{} | device {:?} | tool {:?} | auto {}",
                s.phase,
                s.participant.map_or("-".to_string(), |p| p.to_string()),
                s.trial_index + 1,
                s.trials,
                s.device,
                s.tool,
                if s.auto_advance { "on" } else { "off" },
            ),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Running Suite: bind the Tool listener with `start`, then drive it with `run`.
pub struct SuiteSession {
    state: SessionState,
    events: mpsc::Receiver<LinkEvent>,
}

struct SessionState {
    config: SuiteConfig,
    core: SuiteCore,
    study: StudyFolder,
    device: Endpoint,
    device_link: Option<Link>,
    tool: Endpoint,
    tool_link: Option<Link>,
    timers: Timers<SuiteTimer>,
    events_tx: mpsc::Sender<LinkEvent>,
    notices: mpsc::UnboundedSender<SuiteNotice>,
    listener: Listener,
}

impl SuiteSession {
    pub async fn start(
        config: SuiteConfig,
        notices: mpsc::UnboundedSender<SuiteNotice>,
    ) -> anyhow::Result<Self> {
        let core = SuiteCore::new(config.settings(), config.voltage_map()?);
        let (events_tx, events) = event_channel();
        let listener = listen(Peer::Tool, &config.tool_bind_addr(), events_tx.clone()).await?;
        let study = StudyFolder::new(config.study_folder.clone());
        let mut state = SessionState {
            core,
            study,
            device: Endpoint::new(Peer::Device),
            device_link: None,
            tool: Endpoint::new(Peer::Tool),
            tool_link: None,
            timers: Timers::new(),
            events_tx,
            notices,
            listener,
            config,
        };
        if let Some(participant) = state.config.participant {
            state.load_participant(participant);
        }
        Ok(Self { state, events })
    }

    pub fn tool_addr(&self) -> SocketAddr {
        self.state.listener.local_addr()
    }

    /// Run until `Quit` or until the command channel closes.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<OperatorCommand>) -> anyhow::Result<()> {
        let Self {
            mut state,
            mut events,
        } = self;
        info!(tool = %state.listener.local_addr(), "suite session running");
        loop {
            let deadline = state.timers.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => state.on_link_event(event),
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(OperatorCommand::Quit) | None => break,
                    Some(cmd) => state.on_command(cmd),
                },
                _ = sleep_until(deadline) => state.on_timers_due(),
            }
        }
        info!("suite session stopped");
        Ok(())
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

impl SessionState {
    fn notify(&self, notice: SuiteNotice) {
        let _ = self.notices.send(notice);
    }

    fn fail(&self, message: impl Into<String>) {
        self.notify(SuiteNotice::Error(message.into()));
    }

    fn on_command(&mut self, cmd: OperatorCommand) {
        match cmd {
            OperatorCommand::ConnectDevice => self.connect_device(),
            OperatorCommand::LoadParticipant(n) => self.load_participant(n),
            OperatorCommand::Play => self.play(),
            OperatorCommand::AutoAdvance(on) => {
                info!(auto_advance = on, "auto advance changed");
                self.core.set_auto_advance(on);
            }
            OperatorCommand::Test(factors) => self.test_stimulus(&factors),
            OperatorCommand::Status => self.notify(SuiteNotice::Status(self.status())),
            OperatorCommand::Quit => {}
        }
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            phase: self.core.phase(),
            participant: self.core.participant(),
            trial_index: self.core.trial_index(),
            trials: self.core.trial_set().map_or(0, |s| s.len()),
            device: self.device.state(),
            tool: self.tool.state(),
            auto_advance: self.core.settings().auto_advance,
        }
    }

    fn connect_device(&mut self) {
        if let Err(e) = self.device.begin_connect() {
            self.fail(e.to_string());
            return;
        }
        let addr = self.config.device_addr();
        info!(%addr, "connecting to device");
        self.notify(SuiteNotice::Connection {
            peer: Peer::Device,
            state: self.device.state(),
        });
        spawn_connect(
            Peer::Device,
            addr,
            self.config.connect_timeout(),
            self.events_tx.clone(),
        );
    }

    fn load_participant(&mut self, participant: u32) {
        match self.study.load_trial_set(self.config.illusion, participant) {
            Ok(set) => {
                let trials = set.len();
                self.core.start_trial_set(set);
                self.timers = Timers::new();
                self.notify(SuiteNotice::TrialSetLoaded {
                    participant,
                    trials,
                });
            }
            Err(e) => {
                error!(participant, error = %e, "trial set not loaded");
                self.fail(e.to_string());
            }
        }
    }

    fn play(&mut self) {
        if !self.device.is_connected() {
            self.fail("device is not connected");
            return;
        }
        if !self.tool.is_connected() {
            self.fail("tool is not connected");
            return;
        }
        let result = self.core.play_trial(Instant::now());
        self.handle_result(result);
    }

    fn test_stimulus(&mut self, factors: &TrialFactors) {
        let json = match self.core.test_stimulus(factors) {
            Ok(json) => json,
            Err(e) => {
                error!(factors = %factors, error = %e, "test stimulus rejected");
                self.fail(e.to_string());
                return;
            }
        };
        match &self.device_link {
            Some(link) => match link.send(&json) {
                Ok(()) => info!(factors = %factors, "test stimulus sent"),
                Err(e) => self.fail(format!("device send failed: {e}")),
            },
            None => self.fail("device is not connected"),
        }
    }

    fn handle_result(&mut self, result: Result<Vec<SuiteAction>, TrialError>) {
        match result {
            Ok(actions) => self.apply(actions),
            Err(e @ TrialError::Lookup(_)) => {
                error!(error = %e, "trial not played");
                self.fail(e.to_string());
            }
            Err(e) => {
                warn!(error = %e, "trial request rejected");
                self.fail(e.to_string());
            }
        }
    }

    fn apply(&mut self, actions: Vec<SuiteAction>) {
        // After a failed send the rest of the batch is not sent; notices still go out.
        let mut sending = true;
        for action in actions {
            match action {
                SuiteAction::SendToDevice(json) => {
                    if !sending {
                        continue;
                    }
                    let sent = self.device_link.as_ref().map(|l| l.send(&json));
                    if !matches!(sent, Some(Ok(()))) {
                        self.send_failed(Peer::Device);
                        sending = false;
                    }
                }
                SuiteAction::SendToTool(msg) => {
                    if !sending {
                        continue;
                    }
                    let sent = self.tool_link.as_ref().map(|l| l.send(&msg.to_wire()));
                    if !matches!(sent, Some(Ok(()))) {
                        self.send_failed(Peer::Tool);
                        sending = false;
                    }
                }
                SuiteAction::Schedule { after, timer } => {
                    if sending {
                        self.timers.schedule(Instant::now() + after, timer);
                    }
                }
                SuiteAction::Persist(row) => {
                    let saved = match self.study.append_response_row(&row) {
                        Ok(path) => {
                            self.notify(SuiteNotice::ResponseSaved {
                                participant: row.participant,
                                trial: row.trial,
                                path,
                            });
                            true
                        }
                        Err(e) => {
                            error!(participant = row.participant, trial = row.trial, error = %e, "response not saved");
                            self.fail(format!("response not saved: {e}"));
                            false
                        }
                    };
                    let next = self.core.on_persisted(saved);
                    self.apply(next);
                }
                SuiteAction::TrialStarted { participant, trial } => {
                    if sending {
                        self.notify(SuiteNotice::TrialStarted { participant, trial })
                    }
                }
                SuiteAction::ExperimentEnded { participant } => {
                    self.notify(SuiteNotice::ExperimentEnded { participant })
                }
            }
        }
    }

    fn send_failed(&mut self, peer: Peer) {
        warn!(%peer, "send failed");
        self.core.abandon_trial("send failed");
        self.fail(format!("{peer} send failed"));
    }

    fn on_timers_due(&mut self) {
        let now = Instant::now();
        for timer in self.timers.pop_due(now) {
            let result = self.core.on_timer(timer, now);
            self.handle_result(result);
        }
    }

    fn current_link(&self, peer: Peer) -> Option<&Link> {
        match peer {
            Peer::Device => self.device_link.as_ref(),
            Peer::Tool => self.tool_link.as_ref(),
            Peer::Suite => None,
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(link) => self.on_opened(link),
            LinkEvent::Message { peer, link, text } => {
                if self.current_link(peer).map(Link::id) != Some(link) {
                    debug!(%peer, %link, "message from stale link ignored");
                    return;
                }
                match peer {
                    Peer::Tool => self.on_tool_text(&text),
                    _ => debug!(%peer, %text, "ignoring message"),
                }
            }
            LinkEvent::Closed { peer, link, error } => {
                if self.current_link(peer).map(Link::id) != Some(link) {
                    return;
                }
                match peer {
                    Peer::Device => self.device_link = None,
                    Peer::Tool => self.tool_link = None,
                    Peer::Suite => return,
                }
                self.core.abandon_trial("link lost");
                if self.endpoint(peer).mark_failed() {
                    match &error {
                        Some(e) => warn!(%peer, error = %e, "link failed"),
                        None => warn!(%peer, "link closed by remote"),
                    }
                    self.notify(SuiteNotice::Connection {
                        peer,
                        state: ConnectionState::Failed,
                    });
                }
            }
            LinkEvent::ConnectFailed { peer, error } => {
                if self.endpoint(peer).mark_failed() {
                    self.fail(format!("{peer}: {error}"));
                    self.notify(SuiteNotice::Connection {
                        peer,
                        state: ConnectionState::Failed,
                    });
                }
            }
        }
    }

    fn endpoint(&mut self, peer: Peer) -> &mut Endpoint {
        match peer {
            Peer::Device | Peer::Suite => &mut self.device,
            Peer::Tool => &mut self.tool,
        }
    }

    fn on_opened(&mut self, link: Link) {
        let peer = link.peer();
        match peer {
            Peer::Device => {
                if let Err(e) = self.device.mark_connected() {
                    warn!(error = %e, "unexpected device link dropped");
                    return;
                }
                info!(link = %link.id(), addr = %link.peer_addr(), "device connected");
                self.device_link = Some(link);
            }
            Peer::Tool => {
                if let Some(old) = self.tool_link.take() {
                    info!(old = %old.id(), new = %link.id(), "tool link replaced");
                    self.core.abandon_trial("tool link replaced");
                }
                info!(link = %link.id(), addr = %link.peer_addr(), "tool connected");
                self.tool.mark_accepted();
                self.tool_link = Some(link);
            }
            Peer::Suite => return,
        }
        self.notify(SuiteNotice::Connection {
            peer,
            state: ConnectionState::Connected,
        });
    }

    fn on_tool_text(&mut self, text: &str) {
        let msg = Message::parse(text);
        match self.core.on_tool_message(&msg, Instant::now()) {
            Ok(actions) => self.apply(actions),
            Err(TrialError::Parse(e)) => {
                warn!(%text, error = %e, "bad tool message");
                self.fail(format!("bad tool message {text:?}: {e}"));
            }
            Err(e) => {
                warn!(%text, error = %e, "tool message rejected");
            }
        }
    }
}

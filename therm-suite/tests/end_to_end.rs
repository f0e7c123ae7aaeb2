use std::fs;
use std::time::{Duration, Instant};

use therm_core::{ConnectionState, Peer, SuitePhase};
use therm_suite::{OperatorCommand, StatusReport, SuiteConfig, SuiteNotice, SuiteSession};
use therm_tool::{ParticipantInput, ToolConfig, ToolNotice, ToolSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

async fn wait_for<N: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<N>,
    mut pred: impl FnMut(&N) -> bool,
) -> N {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let notice = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed");
        if pred(&notice) {
            return notice;
        }
    }
}

async fn read_frame(socket: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        tokio::time::timeout(WAIT, socket.read_exact(&mut byte))
            .await
            .expect("timed out reading device frame")
            .unwrap();
        if byte[0] == b'$' {
            return String::from_utf8(out).unwrap();
        }
        out.push(byte[0]);
    }
}

/// Reads one Suite-to-Tool message; a `$` with nothing pending is the command marker.
async fn read_command(socket: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        tokio::time::timeout(WAIT, socket.read_exact(&mut byte))
            .await
            .expect("timed out reading tool command")
            .unwrap();
        if byte[0] == b'$' && !out.is_empty() {
            return String::from_utf8(out).unwrap();
        }
        out.push(byte[0]);
    }
}

async fn status(rig: &mut Rig) -> StatusReport {
    rig.suite_cmd.send(OperatorCommand::Status).unwrap();
    match wait_for(&mut rig.suite_notices, |n| matches!(n, SuiteNotice::Status(_))).await {
        SuiteNotice::Status(report) => report,
        _ => unreachable!(),
    }
}

fn suite_config(study: &std::path::Path, device_port: u16) -> SuiteConfig {
    SuiteConfig {
        study_folder: study.to_path_buf(),
        participant: Some(1),
        device_port,
        tool_bind: "127.0.0.1".into(),
        tool_port: 0,
        trial_overhead_ms: 0,
        cooldown_ms: 0,
        ..SuiteConfig::default()
    }
}

struct Rig {
    _study: tempfile::TempDir,
    study_path: std::path::PathBuf,
    tool_port: u16,
    device: TcpStream,
    suite_cmd: mpsc::UnboundedSender<OperatorCommand>,
    suite_notices: mpsc::UnboundedReceiver<SuiteNotice>,
    tool_input: mpsc::UnboundedSender<ParticipantInput>,
    tool_notices: mpsc::UnboundedReceiver<ToolNotice>,
}

async fn rig(trials: &str) -> Rig {
    let study = tempfile::tempdir().unwrap();
    fs::create_dir_all(study.path().join("trial_info")).unwrap();
    fs::write(study.path().join("trial_info/p1_trial_set.csv"), trials).unwrap();

    let device_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let device_port = device_listener.local_addr().unwrap().port();

    let (suite_notice_tx, mut suite_notices) = mpsc::unbounded_channel();
    let suite = SuiteSession::start(suite_config(study.path(), device_port), suite_notice_tx)
        .await
        .unwrap();
    let tool_port = suite.tool_addr().port();
    let (suite_cmd, suite_cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(suite.run(suite_cmd_rx));
    wait_for(&mut suite_notices, |n| {
        matches!(n, SuiteNotice::TrialSetLoaded { participant: 1, .. })
    })
    .await;

    let (tool_notice_tx, mut tool_notices) = mpsc::unbounded_channel();
    let tool = ToolSession::new(
        ToolConfig {
            suite_port: tool_port,
            ..ToolConfig::default()
        },
        tool_notice_tx,
    );
    let (tool_input, tool_input_rx) = mpsc::unbounded_channel();
    tokio::spawn(tool.run(tool_input_rx));
    wait_for(&mut tool_notices, |n| {
        *n == ToolNotice::Connection(ConnectionState::Connected)
    })
    .await;
    wait_for(&mut suite_notices, |n| {
        *n == SuiteNotice::Connection {
            peer: Peer::Tool,
            state: ConnectionState::Connected,
        }
    })
    .await;

    suite_cmd.send(OperatorCommand::ConnectDevice).unwrap();
    let (device, _) = tokio::time::timeout(WAIT, device_listener.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for(&mut suite_notices, |n| {
        *n == SuiteNotice::Connection {
            peer: Peer::Device,
            state: ConnectionState::Connected,
        }
    })
    .await;

    let study_path = study.path().to_path_buf();
    Rig {
        _study: study,
        study_path,
        tool_port,
        device,
        suite_cmd,
        suite_notices,
        tool_input,
        tool_notices,
    }
}

#[tokio::test]
async fn one_trial_over_loopback() {
    let mut rig = rig("Index,Temperature,Duration,Location\n1,9,2,0.5\n1,-15,1,0\n").await;

    let played = Instant::now();
    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    let json = read_frame(&mut rig.device).await;
    assert_eq!(
        json,
        r#"{"illusion":"funneling","thermalVoltage":1.5,"duration":2.0,"location":0.5}"#
    );

    wait_for(&mut rig.tool_notices, |n| {
        *n == ToolNotice::TrialStarted {
            participant: 1,
            trial: 1,
        }
    })
    .await;
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 0, total: 2, .. })
    })
    .await;
    assert!(played.elapsed() >= Duration::from_millis(1900));

    rig.tool_input.send(ParticipantInput::Answer("3".into())).unwrap();
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 1, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Answer("yes".into())).unwrap();

    let saved = wait_for(&mut rig.suite_notices, |n| {
        matches!(n, SuiteNotice::ResponseSaved { .. })
    })
    .await;
    let SuiteNotice::ResponseSaved { trial, path, .. } = saved else {
        unreachable!()
    };
    assert_eq!(trial, 1);
    assert_eq!(path, rig.study_path.join("trial_responses/p1_response.csv"));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "participantNumber,trialNumber,feltThermal,feltLocation\n1,1,3,yes\n"
    );

    rig.suite_cmd.send(OperatorCommand::Status).unwrap();
    let status = wait_for(&mut rig.suite_notices, |n| matches!(n, SuiteNotice::Status(_))).await;
    let SuiteNotice::Status(report) = status else {
        unreachable!()
    };
    assert_eq!(report.phase, SuitePhase::Idle);
    assert_eq!(report.trial_index, 1);
    assert_eq!(report.trials, 2);
}

#[tokio::test]
async fn single_trial_set_ends_experiment_on_both_sides() {
    let mut rig = rig("Index,Temperature,Duration,Location\n1,0,0,0.25\n").await;

    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    let json = read_frame(&mut rig.device).await;
    assert!(json.contains("\"thermalVoltage\":0.0"));

    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 0, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Skip).unwrap();
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 1, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Answer("left".into())).unwrap();

    wait_for(&mut rig.tool_notices, |n| *n == ToolNotice::ExperimentEnded).await;
    wait_for(&mut rig.suite_notices, |n| {
        *n == SuiteNotice::ExperimentEnded { participant: 1 }
    })
    .await;
    let csv = fs::read_to_string(rig.study_path.join("trial_responses/p1_response.csv")).unwrap();
    assert!(csv.ends_with("1,1,,left\n"));

    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    let err = wait_for(&mut rig.suite_notices, |n| matches!(n, SuiteNotice::Error(_))).await;
    assert_eq!(err, SuiteNotice::Error("trial set already completed".into()));
}

#[tokio::test]
async fn tool_disconnect_abandons_trial() {
    let mut rig = rig("Index,Temperature,Duration,Location\n1,9,5,0.5\n1,9,5,0.5\n").await;

    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    read_frame(&mut rig.device).await;
    wait_for(&mut rig.tool_notices, |n| matches!(n, ToolNotice::TrialStarted { .. })).await;

    rig.tool_input.send(ParticipantInput::Quit).unwrap();
    wait_for(&mut rig.suite_notices, |n| {
        *n == SuiteNotice::Connection {
            peer: Peer::Tool,
            state: ConnectionState::Failed,
        }
    })
    .await;

    let report = status(&mut rig).await;
    assert_eq!(report.phase, SuitePhase::Idle);
    assert_eq!(report.trial_index, 0);
    assert_eq!(report.tool, ConnectionState::Failed);
}

#[tokio::test]
async fn unsaved_response_leaves_trial_to_replay() {
    let mut rig = rig("Index,Temperature,Duration,Location\n1,9,0,0.5\n1,9,0,0.5\n").await;
    let responses = rig.study_path.join("trial_responses");
    fs::write(&responses, "not a folder").unwrap();

    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    read_frame(&mut rig.device).await;
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 0, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Answer("3".into())).unwrap();
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 1, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Answer("yes".into())).unwrap();
    wait_for(&mut rig.suite_notices, |n| {
        matches!(n, SuiteNotice::Error(e) if e.starts_with("response not saved"))
    })
    .await;

    let report = status(&mut rig).await;
    assert_eq!(report.phase, SuitePhase::Idle);
    assert_eq!(report.trial_index, 0);

    fs::remove_file(&responses).unwrap();
    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    read_frame(&mut rig.device).await;
    wait_for(&mut rig.tool_notices, |n| {
        *n == ToolNotice::TrialStarted {
            participant: 1,
            trial: 1,
        }
    })
    .await;
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 0, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Skip).unwrap();
    wait_for(&mut rig.tool_notices, |n| {
        matches!(n, ToolNotice::Question { index: 1, .. })
    })
    .await;
    rig.tool_input.send(ParticipantInput::Answer("no".into())).unwrap();
    wait_for(&mut rig.suite_notices, |n| {
        matches!(n, SuiteNotice::ResponseSaved { trial: 1, .. })
    })
    .await;

    assert_eq!(
        fs::read_to_string(responses.join("p1_response.csv")).unwrap(),
        "participantNumber,trialNumber,feltThermal,feltLocation\n1,1,,no\n"
    );
    assert_eq!(status(&mut rig).await.trial_index, 1);
}

#[tokio::test]
async fn new_tool_connection_replaces_the_old_one() {
    let mut rig = rig("Index,Temperature,Duration,Location\n1,9,5,0.5\n1,9,5,0.5\n").await;

    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    read_frame(&mut rig.device).await;
    wait_for(&mut rig.tool_notices, |n| matches!(n, ToolNotice::TrialStarted { .. })).await;

    let mut second = TcpStream::connect(("127.0.0.1", rig.tool_port)).await.unwrap();
    wait_for(&mut rig.suite_notices, |n| {
        *n == SuiteNotice::Connection {
            peer: Peer::Tool,
            state: ConnectionState::Connected,
        }
    })
    .await;
    let report = status(&mut rig).await;
    assert_eq!(report.phase, SuitePhase::Idle);
    assert_eq!(report.trial_index, 0);
    assert_eq!(report.tool, ConnectionState::Connected);

    // The first tool's socket was closed by the Suite; its heartbeat notices.
    wait_for(&mut rig.tool_notices, |n| {
        *n == ToolNotice::Connection(ConnectionState::Failed)
    })
    .await;

    rig.suite_cmd.send(OperatorCommand::Play).unwrap();
    read_frame(&mut rig.device).await;
    assert_eq!(read_command(&mut second).await, "$trialstart,1,1,5000");
    second.write_all(b"response,1,1,4,no$").await.unwrap();

    let saved = wait_for(&mut rig.suite_notices, |n| {
        matches!(n, SuiteNotice::ResponseSaved { .. })
    })
    .await;
    let SuiteNotice::ResponseSaved { trial, path, .. } = saved else {
        unreachable!()
    };
    assert_eq!(trial, 1);
    assert_eq!(
        fs::read_to_string(path).unwrap(),
        "participantNumber,trialNumber,feltThermal,feltLocation\n1,1,4,no\n"
    );
}

#[tokio::test]
async fn tool_heartbeat_reports_lost_suite_once() {
    let mut rig = rig("Index,Temperature,Duration,Location\n1,9,1,0.5\n").await;

    rig.suite_cmd.send(OperatorCommand::Quit).unwrap();
    wait_for(&mut rig.tool_notices, |n| {
        *n == ToolNotice::Connection(ConnectionState::Failed)
    })
    .await;

    let quiet_until = tokio::time::Instant::now() + Duration::from_millis(2500);
    while let Ok(Some(notice)) = tokio::time::timeout_at(quiet_until, rig.tool_notices.recv()).await {
        assert_ne!(notice, ToolNotice::Connection(ConnectionState::Failed));
    }
}

#[tokio::test]
async fn play_needs_device() {
    let study = tempfile::tempdir().unwrap();
    fs::create_dir_all(study.path().join("trial_info")).unwrap();
    fs::write(study.path().join("trial_info/p1_trial_set.csv"), "h\n1,9,1,0\n").unwrap();

    let (tx, mut notices) = mpsc::unbounded_channel();
    let suite = SuiteSession::start(suite_config(study.path(), 1), tx).await.unwrap();
    let (cmd, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(suite.run(cmd_rx));

    cmd.send(OperatorCommand::Play).unwrap();
    let err = wait_for(&mut notices, |n| matches!(n, SuiteNotice::Error(_))).await;
    assert_eq!(err, SuiteNotice::Error("device is not connected".into()));
}

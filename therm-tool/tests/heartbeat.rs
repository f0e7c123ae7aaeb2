use std::time::{Duration, Instant};

use therm_core::ConnectionState;
use therm_tool::{ParticipantInput, ToolConfig, ToolNotice, ToolSession};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for(rx: &mut mpsc::UnboundedReceiver<ToolNotice>, want: ToolNotice) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let notice = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed");
        if notice == want {
            return;
        }
    }
}

async fn accept(listener: &TcpListener) -> TcpStream {
    let (socket, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for tool")
        .unwrap();
    socket
}

#[tokio::test]
async fn first_check_after_reconnect_waits_a_full_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ToolConfig {
        suite_port: listener.local_addr().unwrap().port(),
        heartbeat_interval_ms: 1000,
        ..ToolConfig::default()
    };
    let (notice_tx, mut notices) = mpsc::unbounded_channel();
    let (input, input_rx) = mpsc::unbounded_channel();
    tokio::spawn(ToolSession::new(config, notice_tx).run(input_rx));

    let socket = accept(&listener).await;
    wait_for(&mut notices, ToolNotice::Connection(ConnectionState::Connected)).await;
    drop(socket);
    wait_for(&mut notices, ToolNotice::Connection(ConnectionState::Failed)).await;

    // Reconnect partway through the original tick schedule.
    tokio::time::sleep(Duration::from_millis(400)).await;
    input.send(ParticipantInput::Connect).unwrap();
    let socket = accept(&listener).await;
    wait_for(&mut notices, ToolNotice::Connection(ConnectionState::Connected)).await;
    let opened = Instant::now();
    drop(socket);
    wait_for(&mut notices, ToolNotice::Connection(ConnectionState::Failed)).await;
    assert!(opened.elapsed() >= Duration::from_millis(900));
}

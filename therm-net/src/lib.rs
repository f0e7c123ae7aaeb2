//! TCP transport: outbound connect with timeout, inbound listener, framed links.
//! I/O tasks never touch session state; everything they observe arrives as a `LinkEvent`.

mod link;

use std::net::SocketAddr;
use std::time::Duration;

use therm_core::wire::{FrameDecodeError, FrameEncodeError};
use therm_core::Peer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use link::{Link, LinkEvent, LinkId};

/// Capacity of the link event channel drained by a session loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect to {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed")]
    Closed,
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode: {0}")]
    Decode(#[from] FrameDecodeError),
}

/// Bounded channel for link events.
pub fn event_channel() -> (mpsc::Sender<LinkEvent>, mpsc::Receiver<LinkEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Connect to `addr` (host:port) within `timeout`; on success the link arrives as `Opened`.
pub async fn connect(
    peer: Peer,
    addr: &str,
    timeout: Duration,
    events: mpsc::Sender<LinkEvent>,
) -> Result<LinkId, ConnectionError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(ConnectionError::Timeout {
                addr: addr.to_string(),
                after: timeout,
            })
        }
    };
    info!(%peer, %addr, "connected");
    link::open(stream, peer, events).await
}

/// Run `connect` on a background task; a failure arrives as `ConnectFailed`.
pub fn spawn_connect(
    peer: Peer,
    addr: String,
    timeout: Duration,
    events: mpsc::Sender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = connect(peer, &addr, timeout, events.clone()).await {
            warn!(%peer, %addr, %error, "connect failed");
            let _ = events.send(LinkEvent::ConnectFailed { peer, error }).await;
        }
    })
}

/// Accept loop handle. Dropping it stops accepting; links already opened stay up.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind `bind` (host:port, port 0 for ephemeral) and open a link for every accepted `peer`.
pub async fn listen(
    peer: Peer,
    bind: &str,
    events: mpsc::Sender<LinkEvent>,
) -> Result<Listener, ConnectionError> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!(%peer, %local_addr, "listening");
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%peer, %addr, "accepted");
                    if let Err(error) = link::open(stream, peer, events.clone()).await {
                        warn!(%peer, %addr, %error, "accepted link dropped");
                        if events.is_closed() {
                            break;
                        }
                    }
                }
                Err(error) => {
                    warn!(%peer, %error, "accept failed");
                    break;
                }
            }
        }
    });
    Ok(Listener { local_addr, task })
}

//! One TCP link: a read task feeding the frame decoder and a single writer task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use therm_core::wire::{encode_frame, FrameDecoder, CHUNK_SIZE};
use therm_core::Peer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ConnectionError;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one link over its lifetime. Ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pushed by I/O tasks into the session loop.
#[derive(Debug)]
pub enum LinkEvent {
    /// Link is up. Its read task starts once this event is delivered.
    Opened(Link),
    Message {
        peer: Peer,
        link: LinkId,
        text: String,
    },
    /// Reported once per link; `error` is None for an orderly close by the remote.
    Closed {
        peer: Peer,
        link: LinkId,
        error: Option<ConnectionError>,
    },
    ConnectFailed {
        peer: Peer,
        error: ConnectionError,
    },
}

/// Handle to a live connection. Dropping it aborts both I/O tasks and closes the socket.
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    peer: Peer,
    peer_addr: SocketAddr,
    connected: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    tasks: [JoinHandle<()>; 2],
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local view only: false once either I/O task has seen the socket fail or close.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Frame `payload` and queue all of its chunks as one unit.
    pub fn send(&self, payload: &str) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        let chunks = encode_frame(payload)?;
        trace!(peer = %self.peer, link = %self.id, %payload, "queue message");
        self.tx.send(chunks).map_err(|_| ConnectionError::Closed)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Split `stream` into I/O tasks and hand the link to the session as `LinkEvent::Opened`.
pub(crate) async fn open(
    stream: TcpStream,
    peer: Peer,
    events: mpsc::Sender<LinkEvent>,
) -> Result<LinkId, ConnectionError> {
    let peer_addr = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let id = LinkId::next();
    let connected = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();
    let (start_tx, start_rx) = oneshot::channel();

    let ctx = TaskContext {
        peer,
        id,
        connected: connected.clone(),
        events: events.clone(),
    };
    let write_task = tokio::spawn(write_loop(writer, rx, ctx.clone()));
    let read_task = tokio::spawn(read_loop(reader, start_rx, ctx));
    let link = Link {
        id,
        peer,
        peer_addr,
        connected,
        tx,
        tasks: [read_task, write_task],
    };
    debug!(%peer, link = %id, %peer_addr, "link opened");
    events
        .send(LinkEvent::Opened(link))
        .await
        .map_err(|_| ConnectionError::Closed)?;
    let _ = start_tx.send(());
    Ok(id)
}

#[derive(Clone)]
struct TaskContext {
    peer: Peer,
    id: LinkId,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<LinkEvent>,
}

impl TaskContext {
    /// First task to observe the failure reports it.
    async fn close(&self, error: Option<ConnectionError>) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(peer = %self.peer, link = %self.id, ?error, "link closed");
            let _ = self
                .events
                .send(LinkEvent::Closed {
                    peer: self.peer,
                    link: self.id,
                    error,
                })
                .await;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, start: oneshot::Receiver<()>, ctx: TaskContext) {
    if start.await.is_err() {
        return;
    }
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(ConnectionError::Io(e)),
        };
        let messages = match decoder.feed(&buf[..n]) {
            Ok(m) => m,
            Err(e) => break Some(ConnectionError::Decode(e)),
        };
        for text in messages {
            trace!(peer = %ctx.peer, link = %ctx.id, %text, "received");
            let event = LinkEvent::Message {
                peer: ctx.peer,
                link: ctx.id,
                text,
            };
            if ctx.events.send(event).await.is_err() {
                return;
            }
        }
    };
    ctx.close(error).await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
    ctx: TaskContext,
) {
    while let Some(chunks) = rx.recv().await {
        for chunk in &chunks {
            if let Err(e) = writer.write_all(chunk).await {
                ctx.close(Some(ConnectionError::Io(e))).await;
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            ctx.close(Some(ConnectionError::Io(e))).await;
            return;
        }
    }
}

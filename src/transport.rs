//! Message-framed channels between the coordinator and the two tiers.
//!
//! The coordinator binds every endpoint it uses. Outbound channels are
//! push-style: each connected tier worker is a peer and messages go out
//! round-robin. The inbound channel is pull-style: frames from all connected
//! peers are merged into one queue. Each frame carries exactly one encoded
//! message behind a 4-byte big-endian length prefix.

use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{PDError, PDResult};

pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Address of one channel: `ipc://<path>` or `tcp://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Ipc(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Filesystem path backing this endpoint, if any.
    pub fn ipc_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Ipc(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = PDError;

    fn from_str(addr: &str) -> PDResult<Self> {
        if let Some(path) = addr.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(PDError::InvalidEndpoint(addr.to_string()));
            }
            return Ok(Endpoint::Ipc(PathBuf::from(path)));
        }
        if let Some(host_port) = addr.strip_prefix("tcp://") {
            return match host_port.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Endpoint::Tcp(host_port.to_string()))
                }
                _ => Err(PDError::InvalidEndpoint(addr.to_string())),
            };
        }
        Err(PDError::InvalidEndpoint(addr.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

fn is_socket_file(path: &Path) -> io::Result<Option<bool>> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta.file_type().is_socket())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove the socket file behind an `ipc://` endpoint. Returns whether a file
/// was removed. Anything other than a socket is left in place.
pub fn remove_ipc_path(endpoint: &Endpoint) -> io::Result<bool> {
    let Some(path) = endpoint.ipc_path() else {
        return Ok(false);
    };
    match is_socket_file(path)? {
        Some(true) => {
            std::fs::remove_file(path)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Outbound half of a channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Enqueue one encoded message. Suspends only on backpressure.
    async fn send(&self, message: Bytes) -> PDResult<()>;

    /// Stop accepting messages and abandon anything not yet written.
    async fn close(&self);
}

/// Inbound half of a channel.
#[async_trait]
pub trait MessageSource: Send {
    /// Suspend until one message is available.
    async fn recv(&mut self) -> PDResult<Bytes>;
}

trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

type PeerWriter = FramedWrite<Box<dyn Connection>, LengthDelimitedCodec>;
type PeerReader = FramedRead<Box<dyn Connection>, LengthDelimitedCodec>;

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> PDResult<Self> {
        match endpoint {
            Endpoint::Ipc(path) => {
                match is_socket_file(path)? {
                    Some(true) => {
                        debug!("Removing stale socket file {}", path.display());
                        std::fs::remove_file(path)?;
                    }
                    Some(false) => {
                        return Err(PDError::Transport(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("{} exists and is not a socket", path.display()),
                        )));
                    }
                    None => {}
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
        }
    }

    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

struct PeerSet {
    writers: Vec<PeerWriter>,
    incoming: mpsc::UnboundedReceiver<PeerWriter>,
    next: usize,
}

/// Push-style outbound channel bound to an endpoint.
pub struct PushChannel {
    endpoint: Endpoint,
    peers: Mutex<PeerSet>,
    closed: CancellationToken,
    acceptor: JoinHandle<()>,
}

impl PushChannel {
    pub async fn bind(endpoint: Endpoint) -> PDResult<Self> {
        let listener = Listener::bind(&endpoint).await?;
        let (tx, incoming) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept_push_peers(listener, endpoint.clone(), tx));
        info!("Push channel bound to {}", endpoint);
        Ok(Self {
            endpoint,
            peers: Mutex::new(PeerSet {
                writers: Vec::new(),
                incoming,
                next: 0,
            }),
            closed: CancellationToken::new(),
            acceptor,
        })
    }

    /// Drop every connected peer so the tiers see EOF.
    async fn release_peers(&self) {
        let mut peers = self.peers.lock().await;
        peers.writers.clear();
        peers.incoming.close();
        while peers.incoming.try_recv().is_ok() {}
    }

    async fn send_to_peer(&self, message: Bytes) -> PDResult<()> {
        let mut peers = self.peers.lock().await;
        loop {
            while let Ok(writer) = peers.incoming.try_recv() {
                peers.writers.push(writer);
            }
            if peers.writers.is_empty() {
                // No tier worker connected yet.
                match peers.incoming.recv().await {
                    Some(writer) => peers.writers.push(writer),
                    None => return Err(PDError::ChannelClosed),
                }
                continue;
            }
            let idx = peers.next % peers.writers.len();
            match peers.writers[idx].send(message.clone()).await {
                Ok(()) => {
                    peers.next = idx + 1;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Dropping peer on {}: {}", self.endpoint, e);
                    peers.writers.swap_remove(idx);
                }
            }
        }
    }
}

#[async_trait]
impl MessageSink for PushChannel {
    async fn send(&self, message: Bytes) -> PDResult<()> {
        if self.closed.is_cancelled() {
            return Err(PDError::ChannelClosed);
        }
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(PDError::ChannelClosed),
            res = self.send_to_peer(message) => res,
        };
        // close() could not take the peers while this send held them.
        if self.closed.is_cancelled() {
            self.release_peers().await;
        }
        result
    }

    async fn close(&self) {
        self.closed.cancel();
        self.acceptor.abort();
        if let Ok(mut peers) = self.peers.try_lock() {
            peers.writers.clear();
            peers.incoming.close();
            while peers.incoming.try_recv().is_ok() {}
        }
        debug!("Push channel {} closed", self.endpoint);
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_push_peers(
    listener: Listener,
    endpoint: Endpoint,
    peers: mpsc::UnboundedSender<PeerWriter>,
) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                debug!("Peer connected to {}", endpoint);
                if peers.send(FramedWrite::new(conn, frame_codec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to accept peer on {}: {}", endpoint, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Pull-style inbound channel bound to an endpoint.
pub struct PullChannel {
    endpoint: Endpoint,
    frames: mpsc::Receiver<io::Result<Bytes>>,
    acceptor: JoinHandle<()>,
}

impl PullChannel {
    pub async fn bind(endpoint: Endpoint, capacity: usize) -> PDResult<Self> {
        let listener = Listener::bind(&endpoint).await?;
        let (tx, frames) = mpsc::channel(capacity);
        let acceptor = tokio::spawn(accept_pull_peers(listener, endpoint.clone(), tx));
        info!("Pull channel bound to {}", endpoint);
        Ok(Self {
            endpoint,
            frames,
            acceptor,
        })
    }

}

#[async_trait]
impl MessageSource for PullChannel {
    async fn recv(&mut self) -> PDResult<Bytes> {
        match self.frames.recv().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(PDError::Transport(e)),
            None => Err(PDError::ChannelClosed),
        }
    }
}

impl Drop for PullChannel {
    fn drop(&mut self) {
        self.acceptor.abort();
        debug!("Pull channel {} closed", self.endpoint);
    }
}

async fn accept_pull_peers(
    listener: Listener,
    endpoint: Endpoint,
    frames: mpsc::Sender<io::Result<Bytes>>,
) {
    // Dropping the set aborts every reader along with the acceptor.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    debug!("Peer connected to {}", endpoint);
                    readers.spawn(forward_frames(
                        FramedRead::new(conn, frame_codec()),
                        endpoint.clone(),
                        frames.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept peer on {}: {}", endpoint, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn forward_frames(
    mut reader: PeerReader,
    endpoint: Endpoint,
    frames: mpsc::Sender<io::Result<Bytes>>,
) {
    while let Some(frame) = reader.next().await {
        let failed = frame.is_err();
        if frames.send(frame.map(BytesMut::freeze)).await.is_err() || failed {
            return;
        }
    }
    debug!("Peer disconnected from {}", endpoint);
}

/// In-process sink paired with a [`MemorySource`].
pub struct MemorySink {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

/// In-process source paired with a [`MemorySink`].
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected in-memory channel with the same framing and ordering
/// guarantees as the socket channels.
pub fn memory_channel() -> (MemorySink, MemorySource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemorySink {
            tx: parking_lot::Mutex::new(Some(tx)),
        },
        MemorySource { rx },
    )
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&self, message: Bytes) -> PDResult<()> {
        let tx = self.tx.lock().clone().ok_or(PDError::ChannelClosed)?;
        tx.send(message).map_err(|_| PDError::ChannelClosed)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

impl MemorySource {
    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> PDResult<Bytes> {
        self.rx.recv().await.ok_or(PDError::ChannelClosed)
    }
}

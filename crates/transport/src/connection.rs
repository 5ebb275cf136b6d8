//! Connection handles: shared writer + single reader.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use warden_protocol::Frame;
use warden_protocol::constants::CONNECT_TIMEOUT;

use crate::BUFFER_SIZE;
use crate::error::TransportError;
use crate::wire::{read_frame, write_frame};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
///
/// Two handles refer to the same socket iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a connection.
///
/// Cheap to share behind an `Arc`; concurrent senders are serialized so
/// frames never interleave on the wire.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

/// Receiving half of a connection.
///
/// Returns `None` once the peer hangs up or the connection is closed.
pub struct FrameReader {
    id: ConnectionId,
    reader: BufReader<BoxedReader>,
    closed: CancellationToken,
}

impl Connection {
    /// Wraps an already-split stream.
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> (Arc<Self>, FrameReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = ConnectionId::next();
        let closed = CancellationToken::new();
        let conn = Arc::new(Self {
            id,
            peer: peer.into(),
            writer: Mutex::new(Some(Box::new(writer))),
            closed: closed.clone(),
        });
        let reader = FrameReader {
            id,
            reader: BufReader::with_capacity(BUFFER_SIZE, Box::new(reader)),
            closed,
        };
        debug!(conn = %id, peer = %conn.peer, "connection opened");
        (conn, reader)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address (or a label for in-memory streams).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns `true` until the connection is closed or fails.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Writes one frame.
    ///
    /// A write failure closes the connection; it is never reused.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        trace!(conn = %self.id, frame = ?frame.frame_type(), "send");
        if let Err(e) = write_frame(writer, frame).await {
            debug!(conn = %self.id, "write failed: {e}");
            // Encoding errors leave the stream in sync; I/O errors do not.
            if !matches!(e, TransportError::Frame(_)) {
                guard.take();
                self.closed.cancel();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sends an ACK frame.
    pub async fn send_ack(&self, code: u16, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(&Frame::ack(code, message)).await
    }

    /// Sends an ERROR frame.
    pub async fn send_error(
        &self,
        code: u16,
        message: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.send(&Frame::error(code, message)).await
    }

    /// Marks the connection closed and wakes the reader. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(conn = %self.id, "connection closed");
        }
        self.closed.cancel();
    }

    /// Closes the connection and shuts down the write side of the socket.
    pub async fn shutdown(&self) {
        self.close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl FrameReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Reads the next frame.
    ///
    /// Any error or EOF closes the connection.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Ok(None),
            r = read_frame(&mut self.reader) => r,
        };
        match &result {
            Ok(Some(frame)) => trace!(conn = %self.id, frame = ?frame.frame_type(), "recv"),
            Ok(None) | Err(_) => self.closed.cancel(),
        }
        result
    }
}

/// Splits a TCP stream into a connection handle and its reader.
pub fn split_stream(stream: TcpStream) -> (Arc<Connection>, FrameReader) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    Connection::new(reader, writer, peer)
}

/// Dials `addr` with [`CONNECT_TIMEOUT`].
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<(Arc<Connection>, FrameReader), TransportError> {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(TransportError::Timeout),
    };
    let local: Option<SocketAddr> = stream.local_addr().ok();
    debug!(?local, "dialed");
    Ok(split_stream(stream))
}

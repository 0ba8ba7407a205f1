//! # Connection Capability
//!
//! Purpose: Describe what the codec and pool need from a transport stream,
//! and provide the TCP implementation used against real devices.
//!
//! ## Design Principles
//! 1. **Capability Interface**: The pool and codec only see `dyn Connection`,
//!    so test doubles and wrapped transports interchange freely.
//! 2. **Explicit Deadlines**: Every blocking call is bounded by a deadline set
//!    beforehand, never by a socket option.
//! 3. **Buffer Reuse**: Bytes past a delimiter stay in the connection buffer.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::Span;

use crate::error::{ClientError, ClientResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocates the next identity.
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Cached and available for the next transaction.
    Idle,
    /// Owned by the transaction currently holding the key's lock.
    InUse,
    /// Shut down; never reused.
    Closed,
}

/// A point in time after which an operation fails with `Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Deadline {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Operations a transport must offer to carry the line protocol.
#[async_trait]
pub trait Connection: Send {
    /// Identity marker, stable for the connection's lifetime.
    fn id(&self) -> ConnectionId;

    /// Address this connection was dialed for.
    fn addr(&self) -> &str;

    /// Logging context attached to this connection.
    fn span(&self) -> &Span;

    fn set_write_deadline(&mut self, deadline: Option<Deadline>);

    fn set_read_deadline(&mut self, deadline: Option<Deadline>);

    /// Issues one write and reports how many bytes the transport accepted.
    ///
    /// A short count is not retried here.
    async fn write(&mut self, buf: &[u8]) -> ClientResult<usize>;

    /// Reads through the next `delim` byte inclusive, bounded by the read
    /// deadline.
    async fn read_until(&mut self, delim: u8) -> ClientResult<Vec<u8>>;

    /// Shuts the transport down. Closing twice is a no-op.
    async fn close(&mut self) -> ClientResult<()>;

    fn is_closed(&self) -> bool;
}

/// TCP stream speaking the projector line protocol.
pub struct TcpConnection {
    id: ConnectionId,
    addr: String,
    stream: Option<TcpStream>,
    // Read buffer survives across calls; only the consumed frame is split off.
    buffer: BytesMut,
    read_deadline: Option<Deadline>,
    write_deadline: Option<Deadline>,
    span: Span,
}

impl TcpConnection {
    /// Wraps an already-connected stream.
    pub fn new(stream: TcpStream, addr: impl Into<String>) -> Self {
        let id = ConnectionId::next();
        let addr = addr.into();
        let span = tracing::info_span!("device", addr = %addr, conn = %id);
        TcpConnection {
            id,
            addr,
            stream: Some(stream),
            buffer: BytesMut::with_capacity(256),
            read_deadline: None,
            write_deadline: None,
            span,
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.stream.is_none())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn span(&self) -> &Span {
        &self.span
    }

    fn set_write_deadline(&mut self, deadline: Option<Deadline>) {
        self.write_deadline = deadline;
    }

    fn set_read_deadline(&mut self, deadline: Option<Deadline>) {
        self.read_deadline = deadline;
    }

    async fn write(&mut self, buf: &[u8]) -> ClientResult<usize> {
        let stream = self.stream.as_mut().ok_or(ClientError::Closed)?;
        within(self.write_deadline, write_once(stream, buf)).await
    }

    async fn read_until(&mut self, delim: u8) -> ClientResult<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(ClientError::Closed)?;
        within(self.read_deadline, read_frame(stream, &mut self.buffer, delim)).await
    }

    async fn close(&mut self) -> ClientResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            tracing::info!(parent: &self.span, "connection closed");
        }
        self.buffer.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Runs `fut` under `deadline`, mapping expiry to `ClientError::Timeout`.
pub(crate) async fn within<F, T>(deadline: Option<Deadline>, fut: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline.instant(), fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(deadline.budget())),
        },
        None => fut.await,
    }
}

async fn write_once(stream: &mut TcpStream, buf: &[u8]) -> ClientResult<usize> {
    let written = stream.write(buf).await?;
    stream.flush().await?;
    Ok(written)
}

/// Longest response accepted before its delimiter arrives.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Reads from `reader` into `buffer` until `delim` is present, then splits
/// the frame (delimiter included) off the front of the buffer.
///
/// A peer that sends more than [`MAX_FRAME_LEN`] bytes without a delimiter
/// yields `Protocol`.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    delim: u8,
) -> ClientResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(pos) = buffer[scanned..].iter().position(|&b| b == delim) {
            let frame = buffer.split_to(scanned + pos + 1);
            return Ok(frame.to_vec());
        }
        scanned = buffer.len();
        if scanned >= MAX_FRAME_LEN {
            return Err(ClientError::Protocol(format!(
                "no delimiter within {} bytes",
                MAX_FRAME_LEN
            )));
        }

        let bytes = reader.read_buf(buffer).await?;
        if bytes == 0 {
            return Err(ClientError::Eof {
                buffered: buffer.len(),
            });
        }
    }
}

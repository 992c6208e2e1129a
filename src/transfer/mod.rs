//! One-directional byte transfer between two streams.
//!
//! Two strategies move the bytes:
//! - Buffered: read into a reusable buffer, pace, write it out.
//! - Splice (Linux): socket -> pipe -> socket via `splice(2)`, so payload
//!   never crosses into user space.
//!
//! The strategy is chosen per transfer by probing the endpoints. Both produce
//! the same bytes on the sink; splice is only a throughput optimisation, and
//! a transfer that finds its descriptors unsuitable mid-way falls back to the
//! buffered path for the rest of its life.
//!
//! Pacing happens after bytes are read (or staged in the pipe) and before
//! they are written, so the wire may run ahead of the bucket by at most one
//! buffer or chunk.

mod copy;
#[cfg(target_os = "linux")]
mod splice;

use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::limiter::TokenBucket;
use crate::telemetry::ByteCounter;

/// Buffer size of the buffered path when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Largest chunk a single splice call is asked to move.
pub const MAX_SPLICE_SIZE: usize = 1 << 20;

/// Which way bytes flow through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream; throttled and counted
    Upload,
    /// Upstream to client
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Copy strategy selected for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Buffered,
    Splice,
}

/// Readable end of a transfer.
pub trait Source: AsyncRead + Unpin + Send {
    /// Socket behind this source, if it can feed `splice(2)`.
    fn socket(&self) -> Option<&TcpStream> {
        None
    }
}

/// Writable end of a transfer.
pub trait Sink: AsyncWrite + Unpin + Send {
    /// Socket behind this sink, if `splice(2)` can drain into it.
    fn socket(&self) -> Option<&TcpStream> {
        None
    }
}

impl Source for OwnedReadHalf {
    fn socket(&self) -> Option<&TcpStream> {
        Some(self.as_ref())
    }
}

impl Sink for OwnedWriteHalf {
    fn socket(&self) -> Option<&TcpStream> {
        Some(self.as_ref())
    }
}

impl Source for DuplexStream {}
impl Sink for DuplexStream {}
impl Source for &[u8] {}
impl Sink for Vec<u8> {}

/// A transfer that failed after delivering `written` bytes.
#[derive(Debug)]
pub struct TransferError {
    pub written: u64,
    pub error: io::Error,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} bytes)", self.error, self.written)
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Knobs shared by every transfer of the process.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Explicit buffer size; forces the buffered path
    pub buffer_size: Option<usize>,
    /// Allow `splice(2)` when the endpoints support it
    pub zero_copy: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            buffer_size: None,
            zero_copy: true,
        }
    }
}

/// A single-direction transfer with optional pacing and counting.
#[derive(Debug, Clone)]
pub struct Transfer {
    direction: Direction,
    options: TransferOptions,
    limiter: Option<Arc<TokenBucket>>,
    counter: Option<Arc<ByteCounter>>,
}

impl Transfer {
    pub fn new(direction: Direction, options: TransferOptions) -> Self {
        Self {
            direction,
            options,
            limiter: None,
            counter: None,
        }
    }

    /// Pace the transfer through `limiter`.
    pub fn with_limiter(mut self, limiter: Option<Arc<TokenBucket>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Add every byte read to `counter`.
    pub fn with_counter(mut self, counter: Arc<ByteCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Pick the copy strategy for this pair of endpoints.
    pub fn mode<R: Source, W: Sink>(&self, src: &R, dst: &W) -> CopyMode {
        if !self.options.zero_copy || self.options.buffer_size.is_some() {
            return CopyMode::Buffered;
        }
        match (src.socket(), dst.socket()) {
            (Some(src), Some(dst)) if splice_capable(src) && splice_capable(dst) => {
                CopyMode::Splice
            }
            _ => CopyMode::Buffered,
        }
    }

    /// Move bytes from `src` to `dst` until `src` reaches end of stream.
    ///
    /// Returns the number of bytes written to `dst`. The sink is not shut
    /// down; half-closing is left to the caller.
    pub async fn run<R: Source, W: Sink>(
        &self,
        src: &mut R,
        dst: &mut W,
    ) -> Result<u64, TransferError> {
        let mut written = 0;

        #[cfg(target_os = "linux")]
        let result = self.relay(src, dst, splice::splice, &mut written).await;
        #[cfg(not(target_os = "linux"))]
        let result = self.copy_buffered(src, dst, &mut written).await;

        match result {
            Ok(()) => Ok(written),
            Err(error) => Err(TransferError { written, error }),
        }
    }

    /// Splice while the endpoints allow it, then finish with the buffered path.
    #[cfg(target_os = "linux")]
    async fn relay<R: Source, W: Sink>(
        &self,
        src: &mut R,
        dst: &mut W,
        op: splice::SpliceFn,
        written: &mut u64,
    ) -> io::Result<()> {
        if self.mode(src, dst) == CopyMode::Splice {
            if let (Some(src_sock), Some(dst_sock)) = (src.socket(), dst.socket()) {
                match splice::copy(self, src_sock, dst_sock, op, written).await? {
                    splice::Outcome::Finished => return Ok(()),
                    splice::Outcome::Unsupported => {
                        tracing::debug!(
                            direction = %self.direction,
                            bytes = *written,
                            "splice unsupported, falling back to buffered copy"
                        );
                    }
                }
            }
        }
        self.copy_buffered(src, dst, written).await
    }

    async fn copy_buffered<R: Source, W: Sink>(
        &self,
        src: &mut R,
        dst: &mut W,
        written: &mut u64,
    ) -> io::Result<()> {
        let buffer_size = self.options.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        copy::copy(self, src, dst, buffer_size, written).await
    }

    /// Pace and count `n` bytes that were just read.
    async fn account(&self, n: u64) {
        if let Some(limiter) = &self.limiter {
            limiter.consume(n).await;
        }
        if let Some(counter) = &self.counter {
            counter.add(n);
        }
    }
}

/// Whether `splice(2)` may be used on this socket.
fn splice_capable(socket: &TcpStream) -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    matches!(
        socket2::SockRef::from(socket).r#type(),
        Ok(ty) if ty == socket2::Type::STREAM
    )
}

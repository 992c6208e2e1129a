//! A relayed client connection.
//!
//! A session dials the upstream for one accepted client and runs the two
//! directions as separate tasks. Each task half-closes its destination when
//! its source ends, so the peer sees EOF while the opposite direction keeps
//! draining. The session owns both sockets: the tasks hand their halves back
//! when they finish, and the connections are only closed once both are done.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, Instrument};

use crate::limiter::TokenBucket;
use crate::telemetry::ByteCounter;
use crate::transfer::{Direction, Sink, Source, Transfer, TransferOptions};

/// Settings every session of the process shares.
#[derive(Debug)]
pub struct SessionConfig {
    pub upstream: String,
    pub connect_timeout: Option<Duration>,
    pub transfer: TransferOptions,
    /// Receives the throttled (upload) byte count
    pub counter: Arc<ByteCounter>,
    /// Log per-session lifecycle events
    pub debug: bool,
}

/// Bytes moved by a finished session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// One downstream client and the upstream connection made for it.
pub struct Session {
    client: TcpStream,
    peer: SocketAddr,
    limiter: Option<Arc<TokenBucket>>,
    config: Arc<SessionConfig>,
}

impl Session {
    pub fn new(
        client: TcpStream,
        peer: SocketAddr,
        limiter: Option<Arc<TokenBucket>>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            client,
            peer,
            limiter,
            config,
        }
    }

    /// Relay until both directions finish.
    ///
    /// Returns `None` if the upstream could not be reached, in which case the
    /// client connection is simply dropped.
    pub async fn run(self) -> Option<SessionStats> {
        let Session {
            client,
            peer,
            limiter,
            config,
        } = self;

        if config.debug {
            debug!(peer = %peer, "new client");
        }

        let upstream = match dial(&config.upstream, config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    peer = %peer,
                    upstream = %config.upstream,
                    error = %e,
                    "failed to connect to upstream"
                );
                return None;
            }
        };
        let upstream_addr = upstream.peer_addr().ok();

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let upload = Transfer::new(Direction::Upload, config.transfer)
            .with_limiter(limiter)
            .with_counter(Arc::clone(&config.counter));
        let download = Transfer::new(Direction::Download, config.transfer);

        let upload_task = tokio::spawn(
            forward(upload, client_read, upstream_write, Some(peer), upstream_addr, config.debug)
                .in_current_span(),
        );
        let download_task = tokio::spawn(
            forward(download, upstream_read, client_write, upstream_addr, Some(peer), config.debug)
                .in_current_span(),
        );

        let (upload_res, download_res) = tokio::join!(upload_task, download_task);

        let mut stats = SessionStats::default();
        let mut halves = (None, None, None, None);
        match upload_res {
            Ok((client_read, upstream_write, n)) => {
                stats.uploaded = n;
                halves.0 = Some(client_read);
                halves.1 = Some(upstream_write);
            }
            Err(e) => error!(peer = %peer, error = %e, "upload task failed"),
        }
        match download_res {
            Ok((upstream_read, client_write, n)) => {
                stats.downloaded = n;
                halves.2 = Some(upstream_read);
                halves.3 = Some(client_write);
            }
            Err(e) => error!(peer = %peer, error = %e, "download task failed"),
        }

        // Both directions are done; dropping the halves closes both sockets.
        drop(halves);

        if config.debug {
            debug!(
                peer = %peer,
                uploaded = stats.uploaded,
                downloaded = stats.downloaded,
                "stop proxying client"
            );
        }
        Some(stats)
    }
}

async fn dial(upstream: &str, timeout: Option<Duration>) -> io::Result<TcpStream> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(upstream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
        None => TcpStream::connect(upstream).await,
    }
}

/// Run one direction, then half-close its destination.
///
/// The endpoints are handed back so the session decides when to close them.
async fn forward<R: Source, W: Sink>(
    transfer: Transfer,
    mut src: R,
    mut dst: W,
    from: Option<SocketAddr>,
    to: Option<SocketAddr>,
    verbose: bool,
) -> (R, W, u64) {
    let from = DisplayAddr(from);
    let to = DisplayAddr(to);
    let direction = transfer.direction();
    if verbose {
        debug!(%from, %to, %direction, "forward start");
    }

    let result = transfer.run(&mut src, &mut dst).await;

    if let Err(e) = dst.shutdown().await {
        debug!(%from, %to, error = %e, "half-close failed");
    }

    let bytes = match result {
        Ok(n) => n,
        Err(e) => {
            error!(
                %from,
                %to,
                %direction,
                bytes = e.written,
                error = %e.error,
                "error while forwarding"
            );
            e.written
        }
    };

    if verbose {
        debug!(%from, %to, %direction, bytes, "forward done");
    }
    (src, dst, bytes)
}

struct DisplayAddr(Option<SocketAddr>);

impl std::fmt::Display for DisplayAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(addr) => addr.fmt(f),
            None => f.write_str("unknown"),
        }
    }
}

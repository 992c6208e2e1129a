//! TCP listeners for the relay.
//!
//! Binds every configured address and runs one accept loop per listener.
//! Each accepted connection gets a limiter according to the configured
//! policy and is handed to its own [`Session`] task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::limiter::{LimitPolicy, Limiter};
use crate::session::{Session, SessionConfig};
use crate::shutdown::{Coordinator, SessionTracker, ShutdownState};
use crate::telemetry::ByteCounter;
use crate::transfer::TransferOptions;

/// Listen backlog for every bound address
const LISTEN_BACKLOG: i32 = 1024;

/// Bound listeners and the state their sessions share.
pub struct Server {
    listeners: Vec<TcpListener>,
    limiter: Limiter,
    sessions: Arc<SessionConfig>,
    coordinator: Arc<Coordinator>,
}

impl Server {
    /// Bind every configured address. Any failure is fatal.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let mut listeners = Vec::with_capacity(config.addrs.len());
        for addr in &config.addrs {
            let listener = bind_listener(addr).await.map_err(|e| {
                error!(address = %addr, error = %e, "Failed to bind listener");
                e
            })?;
            info!(address = %listener.local_addr()?, "Listening");
            listeners.push(listener);
        }

        let policy = if config.per_client {
            LimitPolicy::PerClient
        } else {
            LimitPolicy::Shared
        };

        Ok(Server {
            listeners,
            limiter: Limiter::new(config.rate, config.burst, policy),
            sessions: Arc::new(SessionConfig {
                upstream: config.upstream.clone(),
                connect_timeout: config.connect_timeout,
                transfer: TransferOptions {
                    buffer_size: config.buf_size,
                    zero_copy: config.splice,
                },
                counter: ByteCounter::new(),
                debug: config.debug,
            }),
            coordinator: Arc::new(Coordinator::new()),
        })
    }

    #[cfg(test)]
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Counter of throttled bytes, for telemetry.
    pub fn counter(&self) -> Arc<ByteCounter> {
        Arc::clone(&self.sessions.counter)
    }

    /// Run every accept loop until shutdown.
    ///
    /// Returns once all loops stopped on the shutdown signal, or with the
    /// first fatal accept error.
    pub async fn serve(self) -> io::Result<()> {
        info!(
            listeners = self.listeners.len(),
            upstream = %self.sessions.upstream,
            policy = ?self.limiter.policy(),
            "Accepting connections"
        );

        let mut loops = JoinSet::new();
        for listener in self.listeners {
            loops.spawn(accept_loop(
                listener,
                self.limiter.clone(),
                Arc::clone(&self.sessions),
                self.coordinator.sessions(),
                self.coordinator.subscribe(),
            ));
        }

        while let Some(res) = loops.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
        Ok(())
    }
}

/// Bind a listener, resolving host names first.
async fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let mut last_err = None;
    for resolved in tokio::net::lookup_host(addr).await? {
        match create_listener(resolved) {
            Ok(listener) => return TcpListener::from_std(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{addr} resolved to no address"))
    }))
}

/// Create a non-blocking listening socket with SO_REUSEADDR.
///
/// IPv6 sockets are dual-stack, so `[::]:port` also accepts IPv4 clients.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Errors that concern the pending connection, not the listening socket.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

async fn accept_loop(
    listener: TcpListener,
    limiter: Limiter,
    config: Arc<SessionConfig>,
    tracker: SessionTracker,
    mut shutdown: watch::Receiver<ShutdownState>,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait_for(|s| *s != ShutdownState::Running) => {
                info!(address = %local_addr, "Listener stopped");
                return Ok(());
            }

            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!(address = %local_addr, peer = %peer, "Accepted connection");

                    let session =
                        Session::new(stream, peer, limiter.for_session(), Arc::clone(&config));
                    let guard = tracker.track();
                    tokio::spawn(
                        async move {
                            session.run().await;
                            drop(guard);
                        }
                        .instrument(info_span!("session", peer = %peer)),
                    );
                }
                Err(e) if is_connection_error(&e) => {
                    warn!(address = %local_addr, error = %e, "Connection dropped before accept");
                }
                Err(e) => {
                    error!(address = %local_addr, error = %e, "Accept failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    fn test_config(upstream: SocketAddr) -> Config {
        Config {
            name: None,
            addrs: vec!["127.0.0.1:0".to_string()],
            upstream: upstream.to_string(),
            connect_timeout: None,
            rate: 0,
            burst: 0,
            per_client: false,
            buf_size: None,
            splice: true,
            telemetry_interval: None,
            wait_for_sessions: true,
            drain_timeout: None,
            log_level: "info".to_string(),
            log_console: true,
            log_format: crate::config::LogFormat::Full,
            log_stderr: false,
            debug: false,
        }
    }

    /// Upstream that reads every connection to EOF and reports what it got.
    async fn sink_upstream() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    if stream.read_to_end(&mut data).await.is_ok() {
                        let _ = tx.send(data);
                    }
                });
            }
        });
        (addr, rx)
    }

    /// Upstream that echoes every byte back.
    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        addr
    }

    async fn start(config: Config) -> (SocketAddr, Arc<Coordinator>, JoinHandle<io::Result<()>>) {
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addrs().unwrap()[0];
        let coordinator = server.coordinator();
        let handle = tokio::spawn(server.serve());
        (addr, coordinator, handle)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
    }

    async fn upload(addr: SocketAddr, data: Vec<u8>) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&data).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config("127.0.0.1:9".parse().unwrap());
        config.addrs = vec![taken.local_addr().unwrap().to_string()];
        assert!(Server::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_is_byte_exact_on_both_paths() {
        let data = payload(4 * 1024 * 1024 + 17);
        for (splice, buf_size) in [(true, None), (false, None), (true, Some(4096))] {
            let (upstream, mut received) = sink_upstream().await;
            let mut config = test_config(upstream);
            config.splice = splice;
            config.buf_size = buf_size;
            let (addr, coordinator, handle) = start(config).await;

            upload(addr, data.clone()).await;
            let got = received.recv().await.unwrap();
            assert!(got == data, "mismatch with splice={splice} buf_size={buf_size:?}");

            coordinator.begin_drain();
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_echo_roundtrip_through_relay() {
        let upstream = echo_upstream().await;
        let (addr, coordinator, handle) = start(test_config(upstream)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let data = payload(300_000);
        let (mut r, mut w) = client.split();
        let write = async {
            w.write_all(&data).await.unwrap();
            w.shutdown().await.unwrap();
        };
        let read = async {
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            out
        };
        let ((), echoed) = tokio::join!(write, read);
        assert!(echoed == data);

        coordinator.begin_drain();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_multiple_listeners() {
        let (upstream, mut received) = sink_upstream().await;
        let mut config = test_config(upstream);
        config.addrs = vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()];

        let server = Server::bind(&config).await.unwrap();
        let addrs = server.local_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        let coordinator = server.coordinator();
        let handle = tokio::spawn(server.serve());

        upload(addrs[0], b"first".to_vec()).await;
        upload(addrs[1], b"second".to_vec()).await;
        let mut got = vec![received.recv().await.unwrap(), received.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![b"first".to_vec(), b"second".to_vec()]);

        coordinator.begin_drain();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_but_drains_sessions() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (addr, coordinator, handle) = start(test_config(upstream_addr)).await;

        // A session in flight when the signal arrives.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut up, _) = upstream.accept().await.unwrap();
        client.write_all(b"before ").await.unwrap();

        assert!(coordinator.begin_drain());
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("accept loops should stop")
            .unwrap()
            .unwrap();
        coordinator.finish();

        // The listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());

        // The in-flight session still delivers everything.
        assert_eq!(coordinator.sessions().active(), 1);
        client.write_all(b"and after shutdown").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        up.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"before and after shutdown");
        drop(up);

        assert!(coordinator.drain_sessions(Some(Duration::from_secs(5))).await);
        assert_eq!(coordinator.sessions().active(), 0);
    }

    async fn timed_uploads(config: Config, clients: usize, size: usize) -> Duration {
        let (upstream, mut received) = sink_upstream().await;
        let mut config = config;
        config.upstream = upstream.to_string();
        let (addr, coordinator, handle) = start(config).await;

        let start = Instant::now();
        let uploads: Vec<_> = (0..clients)
            .map(|_| tokio::spawn(upload(addr, vec![0xAB; size])))
            .collect();
        for _ in 0..clients {
            assert_eq!(received.recv().await.unwrap().len(), size);
        }
        let elapsed = start.elapsed();
        for u in uploads {
            u.await.unwrap();
        }

        coordinator.begin_drain();
        handle.await.unwrap().unwrap();
        elapsed
    }

    #[tokio::test]
    async fn test_per_client_limit_is_independent() {
        let mut config = test_config("127.0.0.1:9".parse().unwrap());
        config.rate = 100_000;
        config.burst = 10_000;
        config.per_client = true;

        // Each client: 10 KB burst + 90 KB at 100 KB/s ~= 0.9 s, in parallel.
        let elapsed = timed_uploads(config, 2, 100_000).await;
        assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_shared_limit_bounds_aggregate() {
        let mut config = test_config("127.0.0.1:9".parse().unwrap());
        config.rate = 100_000;
        config.burst = 10_000;
        config.per_client = false;

        // Together: 10 KB burst + 190 KB at 100 KB/s ~= 1.9 s.
        let elapsed = timed_uploads(config, 2, 100_000).await;
        assert!(elapsed >= Duration::from_millis(1700), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_unlimited_is_fast() {
        let config = test_config("127.0.0.1:9".parse().unwrap());
        let elapsed = timed_uploads(config, 2, 8 * 1024 * 1024).await;
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_counter_tracks_upload_only() {
        let upstream = echo_upstream().await;
        let config = test_config(upstream);
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addrs().unwrap()[0];
        let counter = server.counter();
        let coordinator = server.coordinator();
        let handle = tokio::spawn(server.serve());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[5u8; 1000]).await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed.len(), 1000);

        coordinator.begin_drain();
        handle.await.unwrap().unwrap();
        assert!(coordinator.drain_sessions(Some(Duration::from_secs(5))).await);
        assert_eq!(counter.get(), 1000);
    }

    #[tokio::test]
    async fn test_ipv6_wildcard_accepts_ipv4() {
        // Hosts without IPv6 cannot bind the wildcard at all.
        let Ok(listener) = create_listener("[::]:0".parse().unwrap()) else {
            return;
        };
        let listener = TcpListener::from_std(listener).unwrap();
        let port = listener.local_addr().unwrap().port();

        let (client, accepted) = tokio::join!(
            TcpStream::connect(("127.0.0.1", port)),
            listener.accept()
        );
        client.unwrap();
        let (_, peer) = accepted.unwrap();
        assert_eq!(peer.ip().to_canonical(), std::net::IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn test_connection_errors_are_not_fatal() {
        assert!(is_connection_error(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_connection_error(&io::ErrorKind::ConnectionReset.into()));
        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::EMFILE)));
    }
}

//! Graceful shutdown coordination.
//!
//! The coordinator moves through `Running -> Draining -> Stopped`. Accept
//! loops watch the state and return as soon as it leaves `Running`; sessions
//! already in flight are never interrupted. Whether the process also waits
//! for those sessions is decided by the caller through [`Coordinator::drain_sessions`].
//! A second termination signal abandons that wait.

use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Lifecycle of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Accepting connections
    Running,
    /// No new connections; in-flight sessions continue
    Draining,
    /// All accept loops returned
    Stopped,
}

/// Broadcasts the shutdown state and tracks live sessions.
#[derive(Debug)]
pub struct Coordinator {
    state: watch::Sender<ShutdownState>,
    abandoned: watch::Sender<bool>,
    sessions: SessionTracker,
}

impl Coordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        let (abandoned, _) = watch::channel(false);
        Self {
            state,
            abandoned,
            sessions: SessionTracker::default(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Handle used by accept loops to register sessions.
    pub fn sessions(&self) -> SessionTracker {
        self.sessions.clone()
    }

    /// Stop accepting. Returns false if a drain was already under way.
    pub fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// React to a termination signal.
    ///
    /// The first one starts the drain; any later one abandons the wait for
    /// sessions. Returns true once the drain has been abandoned.
    pub fn escalate(&self) -> bool {
        if self.begin_drain() {
            return false;
        }
        self.abandoned.send_replace(true);
        true
    }

    /// Mark every accept loop as returned.
    pub fn finish(&self) {
        self.state.send_replace(ShutdownState::Stopped);
    }

    /// Wait for in-flight sessions to complete.
    ///
    /// Returns false if `timeout` elapsed, or the drain was abandoned, with
    /// sessions still running.
    pub async fn drain_sessions(&self, timeout: Option<Duration>) -> bool {
        let active = self.sessions.active();
        if active == 0 {
            return true;
        }
        info!(active, "Waiting for sessions to finish");

        let mut abandoned = self.abandoned.subscribe();
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = self.sessions.wait_idle() => true,
            _ = abandoned.wait_for(|abandoned| *abandoned) => {
                warn!(
                    active = self.sessions.active(),
                    "Drain abandoned, exiting with sessions running"
                );
                false
            }
            () = deadline => {
                warn!(
                    active = self.sessions.active(),
                    timeout_secs = timeout.map_or(0, |t| t.as_secs()),
                    "Drain timeout elapsed, abandoning sessions"
                );
                false
            }
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counting latch over live sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

impl SessionTracker {
    /// Register a session; it counts as live until the guard drops.
    pub fn track(&self) -> SessionGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        SessionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Resolve once no session is live.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a session counted in its [`SessionTracker`].
#[derive(Debug)]
pub struct SessionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// SIGINT and SIGTERM listeners, installed once and polled repeatedly.
pub struct Signals {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl Signals {
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                interrupt: signal::unix::signal(SignalKind::interrupt())?,
                terminate: signal::unix::signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolve on the next SIGINT or SIGTERM, naming the signal.
    pub async fn recv(&mut self) -> io::Result<&'static str> {
        #[cfg(unix)]
        {
            let name = tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            };
            debug!(signal = name, "Signal caught");
            Ok(name)
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            debug!("Ctrl-C caught");
            Ok("ctrl-c")
        }
    }
}

/// Drive the coordinator from termination signals.
///
/// The first signal starts the drain, the next one abandons it. If the
/// handlers cannot be installed the drain starts straight away.
pub async fn handle_signals(coordinator: Arc<Coordinator>) {
    let mut signals = match Signals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to listen for signals, shutting down");
            coordinator.begin_drain();
            return;
        }
    };

    loop {
        match signals.recv().await {
            Ok(signal) => info!(signal, "signal received, exiting"),
            Err(e) => {
                error!(error = %e, "Failed to listen for signals, shutting down");
                coordinator.begin_drain();
                return;
            }
        }
        if coordinator.escalate() {
            warn!("Second signal, not waiting for sessions");
            return;
        }
    }
}

//! Throughput telemetry.
//!
//! Throttled transfers add the bytes they move to a process-wide
//! [`ByteCounter`]. A background task samples it on a fixed interval and logs
//! the estimated rate in bits per second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::shutdown::ShutdownState;

/// Monotonically increasing byte counter.
#[derive(Debug, Default)]
pub struct ByteCounter {
    bytes: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Bits per second moved between two samples taken `interval` apart.
pub fn bits_per_second(previous: u64, current: u64, interval: Duration) -> u64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (current.wrapping_sub(previous) as f64 * 8.0 / secs) as u64
}

/// Log the throttled throughput every `interval` until shutdown begins.
pub async fn report_task(
    counter: Arc<ByteCounter>,
    interval: Duration,
    mut shutdown: watch::Receiver<ShutdownState>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut previous = counter.get();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|s| *s != ShutdownState::Running) => {
                debug!("Telemetry stopped");
                return;
            }
        }

        let current = counter.get();
        let bps = bits_per_second(previous, current, interval);
        info!(bps, "rate");
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let counter = ByteCounter::new();
        counter.add(10);
        counter.add(32);
        assert_eq!(counter.get(), 42);
    }

    #[test]
    fn test_bits_per_second() {
        assert_eq!(bits_per_second(0, 1000, Duration::from_secs(1)), 8000);
        assert_eq!(bits_per_second(1000, 1000, Duration::from_secs(1)), 0);
        assert_eq!(bits_per_second(0, 1000, Duration::from_secs(2)), 4000);
        assert_eq!(bits_per_second(0, 1000, Duration::ZERO), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_task_stops_on_shutdown() {
        let counter = ByteCounter::new();
        let (tx, rx) = watch::channel(ShutdownState::Running);
        let task = tokio::spawn(report_task(
            Arc::clone(&counter),
            Duration::from_secs(1),
            rx,
        ));

        counter.add(1024);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!task.is_finished());

        tx.send(ShutdownState::Draining).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("telemetry task should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_report_task_stops_when_coordinator_dropped() {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        let task = tokio::spawn(report_task(ByteCounter::new(), Duration::from_secs(60), rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("telemetry task should stop")
            .unwrap();
    }
}

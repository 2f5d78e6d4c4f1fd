//! Success/error counters and the periodic reporter

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct Counters {
    success: AtomicU64,
    error: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub success: u64,
    pub error: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_increment(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_increment(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and zero both counters. Increments racing with this land in
    /// either this snapshot or the next one, never nowhere.
    pub fn take(&self) -> CounterSnapshot {
        CounterSnapshot {
            success: self.success.swap(0, Ordering::AcqRel),
            error: self.error.swap(0, Ordering::AcqRel),
        }
    }

    /// Current values without resetting
    pub fn peek(&self) -> CounterSnapshot {
        CounterSnapshot {
            success: self.success.load(Ordering::Acquire),
            error: self.error.load(Ordering::Acquire),
        }
    }
}

/// Logs and resets the counters on a fixed interval
pub struct Reporter {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reporter {
    pub fn start(counters: Arc<Counters>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            // First report after one full interval
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::report(&counters);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Reporter shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, handle }
    }

    /// Emit one report and reset the counters.
    pub fn report(counters: &Counters) -> CounterSnapshot {
        let snapshot = counters.take();
        info!(
            success = snapshot.success,
            error = snapshot.error,
            "Success: {}, Error: {}",
            snapshot.success,
            snapshot.error
        );
        snapshot
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

//! Liveness Monitor - detects prolonged silence on the inbound connection
//!
//! A single timer task owns the deadline. `reset()` publishes a new deadline
//! through a watch channel and the task re-arms its one sleep, so resetting
//! per message never accumulates timers. When the deadline passes the
//! callback fires once and the timer re-arms for another full period.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

struct Armed {
    timeout: Duration,
    deadline_tx: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

pub struct LivenessMonitor {
    armed: Option<Armed>,
}

impl LivenessMonitor {
    /// Monitor that never fires; `reset()` is a no-op.
    pub fn disabled() -> Self {
        Self { armed: None }
    }

    /// Arm a monitor that calls `on_timeout` after `timeout` without a reset.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(timeout: Duration, on_timeout: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + timeout);
        let task = tokio::spawn(run_timer(timeout, deadline_rx, Arc::new(on_timeout)));

        Self {
            armed: Some(Armed {
                timeout,
                deadline_tx,
                task,
            }),
        }
    }

    /// Monitor that reports each timeout on the returned channel.
    ///
    /// At most one timeout is buffered; a `None` timeout yields a disabled
    /// monitor whose channel is already closed.
    pub fn with_channel(timeout: Option<Duration>) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let monitor = match timeout {
            Some(timeout) => Self::start(timeout, move || {
                // Full means a reconnect is already pending
                let _ = tx.try_send(());
            }),
            None => Self::disabled(),
        };
        (monitor, rx)
    }

    pub fn reset(&self) {
        if let Some(armed) = &self.armed {
            armed.deadline_tx.send_replace(Instant::now() + armed.timeout);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.armed.as_ref().map(|a| a.timeout)
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        if let Some(armed) = &self.armed {
            armed.task.abort();
        }
    }
}

async fn run_timer(
    timeout: Duration,
    mut deadline_rx: watch::Receiver<Instant>,
    on_timeout: TimeoutCallback,
) {
    let sleep = tokio::time::sleep_until(*deadline_rx.borrow_and_update());
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let deadline = *deadline_rx.borrow_and_update();
                sleep.as_mut().reset(deadline);
            }
            _ = &mut sleep => {
                debug!(timeout_secs = timeout.as_secs(), "Liveness deadline elapsed");
                on_timeout();
                sleep.as_mut().reset(Instant::now() + timeout);
            }
        }
    }
}

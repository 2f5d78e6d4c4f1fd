//! Connection Supervisor - owns the broker connection
//!
//! Connects, subscribes every configured topic on each session start, feeds
//! inbound messages to the pipeline without waiting for them, and recycles
//! the connection when the liveness monitor reports a silent period.

use std::sync::Arc;
use std::time::Duration;
use ms_broker::{BrokerConnection, BrokerConnector, BrokerEvent};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::liveness::LivenessMonitor;
use crate::pipeline::MessagePipeline;
use crate::Result;

/// Reconnection settings
const INITIAL_BACKOFF_MS: u64 = 5000;
const MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

enum Step {
    Shutdown,
    SilenceTimeout,
    Event(Option<BrokerEvent>),
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    broker_url: String,
    topics: Vec<String>,
    pipeline: Arc<MessagePipeline>,
    liveness: Arc<LivenessMonitor>,
    timeouts: mpsc::Receiver<()>,
}

impl ConnectionSupervisor {
    /// `timeouts` receives one item per elapsed liveness deadline.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        broker_url: impl Into<String>,
        topics: Vec<String>,
        pipeline: Arc<MessagePipeline>,
        liveness: Arc<LivenessMonitor>,
        timeouts: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            connector,
            broker_url: broker_url.into(),
            topics,
            pipeline,
            liveness,
            timeouts,
        }
    }

    /// Drive the connection until `shutdown` fires.
    ///
    /// Fails only if the very first connection attempt is rejected, which
    /// means the broker URL itself is unusable.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(url = %self.broker_url, "Connecting to broker");
        let mut connection = self.connector.connect(&self.broker_url).await?;

        loop {
            let step = tokio::select! {
                biased;

                _ = shutdown.recv() => Step::Shutdown,
                _ = liveness_timeout(&mut self.timeouts) => Step::SilenceTimeout,
                event = connection.next_event() => Step::Event(event),
            };

            match step {
                Step::Shutdown => {
                    info!("Disconnecting from broker");
                    connection.disconnect(false).await;
                    return Ok(());
                }
                Step::SilenceTimeout => {
                    let secs = self.liveness.timeout().map(|t| t.as_secs()).unwrap_or_default();
                    warn!("No data received for {} seconds, reconnecting", secs);
                    connection.disconnect(true).await;

                    match self.reconnect(&mut shutdown).await {
                        Some(fresh) => connection = fresh,
                        None => return Ok(()),
                    }
                }
                Step::Event(Some(event)) => self.on_event(connection.as_mut(), event).await,
                Step::Event(None) => {
                    warn!("Broker connection closed, reconnecting");
                    drop(connection);

                    match self.reconnect(&mut shutdown).await {
                        Some(fresh) => connection = fresh,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn on_event(&self, connection: &mut dyn BrokerConnection, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                info!(url = %self.broker_url, "Connected to broker");
                self.subscribe_all(connection).await;
            }
            BrokerEvent::Subscribed { granted } => {
                info!(granted = ?granted, "Subscription acknowledged");
            }
            BrokerEvent::Message { topic, payload } => {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move {
                    pipeline.handle(&topic, &payload).await;
                });
            }
            BrokerEvent::Error(message) => {
                warn!(error = %message, "Broker connection error");
            }
        }
    }

    async fn subscribe_all(&self, connection: &mut dyn BrokerConnection) {
        for topic in &self.topics {
            info!(topic = %topic, "Subscribing");
            if let Err(e) = connection.subscribe(topic).await {
                error!(topic = %topic, error = %e, "Subscription failed");
            }
        }
    }

    /// Open a new connection, backing off on failure.
    ///
    /// Returns `None` if shutdown was requested while waiting.
    async fn reconnect(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<Box<dyn BrokerConnection>> {
        let mut consecutive_failures = 0u32;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            info!(url = %self.broker_url, "Connecting to broker");
            match self.connector.connect(&self.broker_url).await {
                Ok(connection) => {
                    // Full grace period for the new session
                    self.liveness.reset();
                    while self.timeouts.try_recv().is_ok() {}
                    return Some(connection);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        "Failed to connect to broker (attempt {}), retrying in {}ms: {}",
                        consecutive_failures, backoff_ms, e
                    );

                    tokio::select! {
                        _ = shutdown.recv() => return None,
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                    backoff_ms = ((backoff_ms as f64 * BACKOFF_MULTIPLIER) as u64).min(MAX_BACKOFF_MS);
                }
            }
        }
    }
}

/// Resolves on the next liveness timeout; never resolves when monitoring is off.
async fn liveness_timeout(timeouts: &mut mpsc::Receiver<()>) {
    if timeouts.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

//! Message Pipeline - per-message parse, transform, route and publish
//!
//! `handle()` never fails across its boundary. Every message ends in one
//! [`Outcome`]; failures after a successful parse are counted as errors and
//! logged, malformed payloads are logged and dropped without counting.

use std::sync::Arc;
use ms_common::StreamHandle;
use ms_platform::StreamPlatform;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::counters::Counters;
use crate::error::BridgeError;
use crate::liveness::LivenessMonitor;
use crate::resolver::StreamResolver;
use crate::transform::Transform;
use crate::Result;

/// Where messages are published
#[derive(Clone)]
pub enum Destination {
    /// Pre-existing stream used for every message; nothing is ever created
    Fixed(StreamHandle),
    /// Per-topic stream resolved (and auto-created) by the resolver
    Resolve(Arc<StreamResolver>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub verbose: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Published { stream: StreamHandle },
    /// Processed without publishing
    DryRun,
    /// Payload was not valid JSON
    Discarded,
    Failed,
}

pub struct MessagePipeline {
    platform: Arc<dyn StreamPlatform>,
    destination: Destination,
    transform: Option<Arc<dyn Transform>>,
    counters: Arc<Counters>,
    liveness: Arc<LivenessMonitor>,
    options: PipelineOptions,
}

impl MessagePipeline {
    pub fn new(
        platform: Arc<dyn StreamPlatform>,
        destination: Destination,
        counters: Arc<Counters>,
        liveness: Arc<LivenessMonitor>,
    ) -> Self {
        Self {
            platform,
            destination,
            transform: None,
            counters,
            liveness,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Outcome {
        self.liveness.reset();

        let message: Value = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Discarding message that is not valid JSON");
                return Outcome::Discarded;
            }
        };

        match self.process(topic, message).await {
            Ok(outcome) => {
                self.counters.success_increment();
                outcome
            }
            Err(e) => {
                self.counters.error_increment();
                error!(topic = %topic, error = %e, "Failed to forward message");
                Outcome::Failed
            }
        }
    }

    async fn process(&self, topic: &str, message: Value) -> Result<Outcome> {
        let message = match &self.transform {
            Some(transform) => transform.evaluate(&message)?,
            None => message,
        };

        let stream = self.destination_for(topic).await?;

        if self.options.verbose {
            let target = stream
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(dry-run)".to_string());
            info!(
                "{}{} -> {}\n{}",
                if self.options.dry_run { "DRY-RUN: " } else { "" },
                topic,
                target,
                message
            );
        }

        if self.options.dry_run {
            return Ok(Outcome::DryRun);
        }

        // destination_for only yields None in dry-run mode
        let Some(stream) = stream else {
            return Ok(Outcome::DryRun);
        };

        self.platform
            .publish(&stream.id, &message)
            .await
            .map_err(|e| BridgeError::publish(stream.to_string(), e))?;

        Ok(Outcome::Published { stream })
    }

    async fn destination_for(&self, topic: &str) -> Result<Option<StreamHandle>> {
        match &self.destination {
            Destination::Fixed(stream) => Ok(Some(stream.clone())),
            Destination::Resolve(_) if self.options.dry_run => Ok(None),
            Destination::Resolve(resolver) => resolver.resolve(topic).await.map(Some),
        }
    }
}

//! Wires the bridge components together from a validated configuration

use std::sync::Arc;
use ms_broker::BrokerConnector;
use ms_common::StreamHandle;
use ms_config::BridgeConfig;
use ms_platform::StreamPlatform;
use tokio::sync::broadcast;
use tracing::info;

use crate::counters::{Counters, Reporter};
use crate::liveness::LivenessMonitor;
use crate::pipeline::{Destination, MessagePipeline, PipelineOptions};
use crate::resolver::{RouteRules, StreamResolver};
use crate::supervisor::ConnectionSupervisor;
use crate::transform::{JmesPathTransform, Transform};
use crate::Result;

pub struct Bridge {
    config: BridgeConfig,
    pipeline: Arc<MessagePipeline>,
    supervisor: ConnectionSupervisor,
    counters: Arc<Counters>,
}

impl Bridge {
    /// Build every component. Must be called from within a tokio runtime
    /// because the liveness timer starts immediately.
    ///
    /// Fails if the transform expression does not compile.
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn BrokerConnector>,
        platform: Arc<dyn StreamPlatform>,
    ) -> Result<Self> {
        let destination = match &config.stream_id {
            Some(stream_id) => {
                info!(stream = %stream_id, "Publishing every message to a single stream");
                Destination::Fixed(StreamHandle::from_id(stream_id.clone()))
            }
            None => Destination::Resolve(Arc::new(StreamResolver::new(
                platform.clone(),
                RouteRules::new(config.stream_name_template.clone(), config.topic_levels),
                config.make_public,
            ))),
        };

        let counters = Arc::new(Counters::new());
        let (liveness, timeouts) = LivenessMonitor::with_channel(config.silence_timeout());
        let liveness = Arc::new(liveness);

        let mut pipeline = MessagePipeline::new(platform, destination, counters.clone(), liveness.clone())
            .with_options(PipelineOptions {
                verbose: config.verbose,
                dry_run: config.dry_run,
            });
        if let Some(source) = &config.transform {
            let transform: Arc<dyn Transform> = Arc::new(JmesPathTransform::compile(source)?);
            pipeline = pipeline.with_transform(transform);
        }
        let pipeline = Arc::new(pipeline);

        let supervisor = ConnectionSupervisor::new(
            connector,
            config.broker_url.clone(),
            config.topics.clone(),
            pipeline.clone(),
            liveness,
            timeouts,
        );

        Ok(Self {
            config,
            pipeline,
            supervisor,
            counters,
        })
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Run until `shutdown` fires or the first broker connection is rejected.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let Bridge {
            config,
            supervisor,
            counters,
            ..
        } = self;

        if config.dry_run {
            info!("Dry run: no streams will be created and nothing will be published");
        }

        let reporter = Reporter::start(counters, config.report_interval());
        let result = supervisor.run(shutdown).await;
        reporter.shutdown().await;

        info!("Bridge stopped");
        result
    }
}

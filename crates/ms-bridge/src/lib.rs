//! MQTT to Streamr bridge core
//!
//! This crate provides the topic-to-stream routing and publish pipeline:
//! - StreamResolver: Maps topics to destination streams with single-flight creation
//! - MessagePipeline: Per-message parse, transform, route and publish
//! - LivenessMonitor: Silence detection on the inbound connection
//! - ConnectionSupervisor: Broker connect, subscribe and reconnect
//! - Counters / Reporter: Success and error counts, reported and reset periodically
//! - Bridge: Assembles the above from a `BridgeConfig`

pub mod error;
pub mod resolver;
pub mod pipeline;
pub mod liveness;
pub mod supervisor;
pub mod counters;
pub mod transform;
pub mod bridge;

pub use error::{BridgeError, TransformError};
pub use resolver::{truncate_topic, RouteRules, StreamResolver};
pub use pipeline::{Destination, MessagePipeline, Outcome, PipelineOptions};
pub use liveness::LivenessMonitor;
pub use supervisor::ConnectionSupervisor;
pub use counters::{CounterSnapshot, Counters, Reporter};
pub use transform::{JmesPathTransform, Transform};
pub use bridge::Bridge;

pub type Result<T> = std::result::Result<T, BridgeError>;

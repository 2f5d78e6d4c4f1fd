//! Bridge Core Tests
//!
//! Tests for:
//! - Single-flight stream resolution and failure eviction
//! - Public-read grants
//! - Message pipeline outcomes and counters
//! - Reconnect on silence and per-topic subscription errors
//! - End-to-end wiring through `Bridge`

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use ms_broker::{BrokerConnection, BrokerConnector, BrokerError, BrokerEvent};
use ms_common::{Principal, StreamHandle, StreamOperation};
use ms_config::BridgeSettings;
use ms_platform::{PlatformError, StreamPlatform};
use ms_bridge::{
    Bridge, BridgeError, ConnectionSupervisor, CounterSnapshot, Counters, Destination,
    JmesPathTransform, LivenessMonitor, MessagePipeline, Outcome, PipelineOptions, RouteRules,
    StreamResolver, TransformError,
};

/// Mock platform that counts every call
#[derive(Default)]
struct MockPlatform {
    lookups: AtomicUsize,
    permission_checks: AtomicUsize,
    grants: AtomicUsize,
    failing_lookups: AtomicUsize,
    fail_publish: AtomicBool,
    delay: Duration,
    public_streams: parking_lot::Mutex<HashSet<String>>,
    published: parking_lot::Mutex<Vec<(String, Value)>>,
}

impl MockPlatform {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl StreamPlatform for MockPlatform {
    async fn get_or_create_stream(&self, name: &str) -> ms_platform::Result<StreamHandle> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let should_fail = self
            .failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PlatformError::Status {
                method: "GET".to_string(),
                url: "/streams".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        Ok(StreamHandle::new(format!("id:{}", name), name))
    }

    async fn has_permission(
        &self,
        stream: &StreamHandle,
        operation: StreamOperation,
        principal: &Principal,
    ) -> ms_platform::Result<bool> {
        self.permission_checks.fetch_add(1, Ordering::SeqCst);
        assert_eq!(operation, StreamOperation::Read);
        assert_eq!(principal, &Principal::Anyone);
        Ok(self.public_streams.lock().contains(&stream.id))
    }

    async fn grant_permission(
        &self,
        stream: &StreamHandle,
        _operation: StreamOperation,
        _principal: &Principal,
    ) -> ms_platform::Result<()> {
        self.grants.fetch_add(1, Ordering::SeqCst);
        self.public_streams.lock().insert(stream.id.clone());
        Ok(())
    }

    async fn publish(&self, stream_id: &str, payload: &Value) -> ms_platform::Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(PlatformError::Status {
                method: "POST".to_string(),
                url: format!("/streams/{}/data", stream_id),
                status: 500,
                body: String::new(),
            });
        }
        self.published.lock().push((stream_id.to_string(), payload.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct BrokerLog {
    connects: usize,
    subscriptions: Vec<String>,
    disconnects: Vec<bool>,
}

/// Mock broker: every connection replays the same script, then stays silent
struct MockConnector {
    log: Arc<parking_lot::Mutex<BrokerLog>>,
    script: Vec<BrokerEvent>,
    failing_topics: Vec<String>,
}

impl MockConnector {
    fn new(script: Vec<BrokerEvent>) -> Self {
        Self {
            log: Arc::new(parking_lot::Mutex::new(BrokerLog::default())),
            script,
            failing_topics: Vec::new(),
        }
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(&self, _url: &str) -> ms_broker::Result<Box<dyn BrokerConnection>> {
        self.log.lock().connects += 1;
        Ok(Box::new(MockConnection {
            events: self.script.iter().cloned().collect(),
            log: self.log.clone(),
            failing_topics: self.failing_topics.clone(),
        }))
    }
}

struct MockConnection {
    events: VecDeque<BrokerEvent>,
    log: Arc<parking_lot::Mutex<BrokerLog>>,
    failing_topics: Vec<String>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn next_event(&mut self) -> Option<BrokerEvent> {
        match self.events.pop_front() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self, topic_pattern: &str) -> ms_broker::Result<()> {
        self.log.lock().subscriptions.push(topic_pattern.to_string());
        if self.failing_topics.iter().any(|t| t == topic_pattern) {
            return Err(BrokerError::Subscribe {
                topic: topic_pattern.to_string(),
                message: "not authorized".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(self: Box<Self>, forced: bool) {
        self.log.lock().disconnects.push(forced);
    }
}

fn resolver(platform: Arc<MockPlatform>, rules: RouteRules, make_public: bool) -> Arc<StreamResolver> {
    Arc::new(StreamResolver::new(platform, rules, make_public))
}

fn pipeline(platform: Arc<MockPlatform>, destination: Destination) -> MessagePipeline {
    MessagePipeline::new(
        platform,
        destination,
        Arc::new(Counters::new()),
        Arc::new(LivenessMonitor::disabled()),
    )
}

fn message(topic: &str, payload: &'static str) -> BrokerEvent {
    BrokerEvent::Message {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload.as_bytes()),
    }
}

// ============================================================================
// Stream Resolver
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_resolutions_share_one_platform_call() {
    let platform = Arc::new(MockPlatform::with_delay(Duration::from_millis(200)));
    let resolver = resolver(platform.clone(), RouteRules::default(), false);

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("sensors/temp").await })
        })
        .collect();

    for task in tasks {
        let stream = task.await.unwrap().unwrap();
        assert_eq!(stream, StreamHandle::new("id:sensors/temp", "sensors/temp"));
    }

    assert_eq!(platform.lookups(), 1);
    assert_eq!(resolver.len(), 1);
}

#[tokio::test]
async fn test_resolved_stream_is_cached() {
    let platform = Arc::new(MockPlatform::new());
    let resolver = resolver(platform.clone(), RouteRules::new("/$topic", None), false);

    assert!(resolver.cached("a/b").is_none());
    resolver.resolve("a/b").await.unwrap();
    resolver.resolve("a/b").await.unwrap();

    assert_eq!(platform.lookups(), 1);
    assert_eq!(resolver.cached("a/b").unwrap().name, "/a/b");
}

#[tokio::test(start_paused = true)]
async fn test_truncated_topics_share_a_stream() {
    let platform = Arc::new(MockPlatform::with_delay(Duration::from_millis(200)));
    let resolver = resolver(platform.clone(), RouteRules::new("$topic", Some(1)), false);

    let tasks: Vec<_> = ["/europe/switzerland", "/europe/finland"]
        .into_iter()
        .map(|topic| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(topic).await })
        })
        .collect();

    let mut streams = Vec::new();
    for task in tasks {
        streams.push(task.await.unwrap().unwrap());
    }

    assert_eq!(streams[0], streams[1]);
    assert_eq!(streams[0].name, "/europe");
    assert_eq!(platform.lookups(), 1);
    assert_eq!(resolver.len(), 1);
}

#[tokio::test]
async fn test_make_public_grants_only_when_missing() {
    let platform = Arc::new(MockPlatform::new());
    platform.public_streams.lock().insert("id:already".to_string());
    let resolver = resolver(platform.clone(), RouteRules::default(), true);

    resolver.resolve("already").await.unwrap();
    assert_eq!(platform.permission_checks.load(Ordering::SeqCst), 1);
    assert_eq!(platform.grants.load(Ordering::SeqCst), 0);

    resolver.resolve("fresh").await.unwrap();
    resolver.resolve("fresh").await.unwrap();
    assert_eq!(platform.permission_checks.load(Ordering::SeqCst), 2);
    assert_eq!(platform.grants.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_resolution_is_retried_by_next_caller() {
    let platform = Arc::new(MockPlatform::new());
    platform.failing_lookups.store(1, Ordering::SeqCst);
    let resolver = resolver(platform.clone(), RouteRules::default(), false);

    let err = resolver.resolve("a").await.unwrap_err();
    assert!(matches!(err, BridgeError::Resolution { ref route_key, .. } if route_key == "a"));
    assert!(resolver.is_empty());

    let stream = resolver.resolve("a").await.unwrap();
    assert_eq!(stream.id, "id:a");
    assert_eq!(platform.lookups(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_waiters_share_a_failure() {
    let platform = Arc::new(MockPlatform::with_delay(Duration::from_millis(100)));
    platform.failing_lookups.store(1, Ordering::SeqCst);
    let resolver = resolver(platform.clone(), RouteRules::default(), false);

    let (a, b) = tokio::join!(resolver.resolve("t"), resolver.resolve("t"));
    assert!(a.is_err());
    assert!(b.is_err());
    assert_eq!(platform.lookups(), 1);
}

// ============================================================================
// Message Pipeline
// ============================================================================

#[tokio::test]
async fn test_pipeline_publishes_to_resolved_stream() {
    let platform = Arc::new(MockPlatform::new());
    let pipeline = pipeline(
        platform.clone(),
        Destination::Resolve(resolver(platform.clone(), RouteRules::default(), false)),
    );

    let outcome = pipeline.handle("home/kitchen", br#"{"temp": 21}"#).await;

    assert_eq!(
        outcome,
        Outcome::Published {
            stream: StreamHandle::new("id:home/kitchen", "home/kitchen")
        }
    );
    assert_eq!(platform.published(), vec![("id:home/kitchen".to_string(), json!({"temp": 21}))]);
    assert_eq!(pipeline.counters().peek(), CounterSnapshot { success: 1, error: 0 });
}

#[tokio::test]
async fn test_malformed_json_changes_nothing() {
    let platform = Arc::new(MockPlatform::new());
    let pipeline = pipeline(
        platform.clone(),
        Destination::Resolve(resolver(platform.clone(), RouteRules::default(), false)),
    );

    assert_eq!(pipeline.handle("a", b"temp=21").await, Outcome::Discarded);

    assert_eq!(platform.lookups(), 0);
    assert!(platform.published().is_empty());
    assert_eq!(pipeline.counters().peek(), CounterSnapshot::default());
}

#[tokio::test]
async fn test_dry_run_without_stream_id_skips_platform() {
    let platform = Arc::new(MockPlatform::new());
    let pipeline = pipeline(
        platform.clone(),
        Destination::Resolve(resolver(platform.clone(), RouteRules::default(), true)),
    )
    .with_options(PipelineOptions {
        verbose: true,
        dry_run: true,
    });

    assert_eq!(pipeline.handle("a/b", br#"{"ok": true}"#).await, Outcome::DryRun);

    assert_eq!(platform.lookups(), 0);
    assert_eq!(platform.grants.load(Ordering::SeqCst), 0);
    assert!(platform.published().is_empty());
    assert_eq!(pipeline.counters().peek(), CounterSnapshot { success: 1, error: 0 });
}

#[tokio::test]
async fn test_fixed_stream_bypasses_resolution() {
    let platform = Arc::new(MockPlatform::new());
    let pipeline = pipeline(platform.clone(), Destination::Fixed(StreamHandle::from_id("fixed-stream")));

    pipeline.handle("a", b"1").await;
    pipeline.handle("b", b"2").await;

    assert_eq!(platform.lookups(), 0);
    assert_eq!(
        platform.published(),
        vec![
            ("fixed-stream".to_string(), json!(1)),
            ("fixed-stream".to_string(), json!(2)),
        ]
    );
}

#[tokio::test]
async fn test_transform_failure_counts_error() {
    let platform = Arc::new(MockPlatform::new());
    let transform = Arc::new(JmesPathTransform::compile("abs(name)").unwrap());
    let pipeline = pipeline(platform.clone(), Destination::Fixed(StreamHandle::from_id("s")))
        .with_transform(transform);

    assert_eq!(pipeline.handle("a", br#"{"name": "x"}"#).await, Outcome::Failed);

    assert!(platform.published().is_empty());
    assert_eq!(pipeline.counters().peek(), CounterSnapshot { success: 0, error: 1 });
}

#[tokio::test]
async fn test_resolution_and_publish_failures_are_counted() {
    let platform = Arc::new(MockPlatform::new());
    platform.failing_lookups.store(1, Ordering::SeqCst);
    let pipeline = pipeline(
        platform.clone(),
        Destination::Resolve(resolver(platform.clone(), RouteRules::default(), false)),
    );

    assert_eq!(pipeline.handle("a", b"{}").await, Outcome::Failed);

    platform.fail_publish.store(true, Ordering::SeqCst);
    assert_eq!(pipeline.handle("a", b"{}").await, Outcome::Failed);

    platform.fail_publish.store(false, Ordering::SeqCst);
    assert!(matches!(pipeline.handle("a", b"{}").await, Outcome::Published { .. }));

    assert_eq!(pipeline.counters().take(), CounterSnapshot { success: 1, error: 2 });
}

// ============================================================================
// Connection Supervisor
// ============================================================================

fn supervisor(
    connector: MockConnector,
    platform: Arc<MockPlatform>,
    topics: &[&str],
    silence: Option<Duration>,
) -> ConnectionSupervisor {
    let (liveness, timeouts) = LivenessMonitor::with_channel(silence);
    let liveness = Arc::new(liveness);
    let pipeline = Arc::new(MessagePipeline::new(
        platform,
        Destination::Fixed(StreamHandle::from_id("s")),
        Arc::new(Counters::new()),
        liveness.clone(),
    ));

    ConnectionSupervisor::new(
        Arc::new(connector),
        "mqtt://broker.test:1883",
        topics.iter().map(|t| t.to_string()).collect(),
        pipeline,
        liveness,
        timeouts,
    )
}

#[tokio::test(start_paused = true)]
async fn test_silence_timeout_forces_one_reconnect() {
    let connector = MockConnector::new(vec![BrokerEvent::Connected]);
    let log = connector.log.clone();
    let supervisor = supervisor(
        connector,
        Arc::new(MockPlatform::new()),
        &["sensors/#", "alerts/+"],
        Some(Duration::from_secs(10)),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(5)).await;
    {
        let log = log.lock();
        assert_eq!(log.connects, 1);
        assert_eq!(log.subscriptions, vec!["sensors/#", "alerts/+"]);
        assert!(log.disconnects.is_empty());
    }

    tokio::time::sleep(Duration::from_secs(6)).await;
    {
        let log = log.lock();
        assert_eq!(log.connects, 2);
        assert_eq!(log.disconnects, vec![true]);
        assert_eq!(
            log.subscriptions,
            vec!["sensors/#", "alerts/+", "sensors/#", "alerts/+"]
        );
    }

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(log.lock().disconnects, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_messages_are_handed_to_pipeline() {
    let connector = MockConnector::new(vec![BrokerEvent::Connected, message("a/1", r#"{"n": 1}"#)]);
    let log = connector.log.clone();
    let platform = Arc::new(MockPlatform::new());
    let supervisor = supervisor(connector, platform.clone(), &["a/#"], Some(Duration::from_secs(10)));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(log.lock().connects, 1);
    assert_eq!(platform.published(), vec![("s".to_string(), json!({"n": 1}))]);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(log.lock().disconnects, vec![false]);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_liveness_never_reconnects() {
    let connector = MockConnector::new(vec![BrokerEvent::Connected]);
    let log = connector.log.clone();
    let supervisor = supervisor(connector, Arc::new(MockPlatform::new()), &["a"], None);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(log.lock().connects, 1);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscription_error_does_not_abort_other_topics() {
    let mut connector = MockConnector::new(vec![BrokerEvent::Connected]);
    connector.failing_topics = vec!["forbidden/#".to_string()];
    let log = connector.log.clone();
    let supervisor = supervisor(
        connector,
        Arc::new(MockPlatform::new()),
        &["a/#", "forbidden/#", "b/#"],
        None,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while log.lock().subscriptions.len() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(log.lock().subscriptions, vec!["a/#", "forbidden/#", "b/#"]);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Bridge
// ============================================================================

fn settings() -> BridgeSettings {
    BridgeSettings {
        mqtt_url: Some("mqtt://broker.test:1883".to_string()),
        topics: vec!["home/#".to_string()],
        api_key: Some("test-key".to_string()),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_bridge_forwards_messages_end_to_end() {
    let connector = MockConnector::new(vec![
        BrokerEvent::Connected,
        message("home/kitchen/temp", r#"{"reading": {"value": 20.5}}"#),
        message("home/kitchen/humidity", "not json"),
        message("home/garage/temp", r#"{"reading": {"value": 7}}"#),
    ]);
    let log = connector.log.clone();
    let platform = Arc::new(MockPlatform::new());

    let config = BridgeSettings {
        stream_name_template: Some("house $topic".to_string()),
        topic_levels: Some(1),
        transform: Some("reading.value".to_string()),
        public: true,
        ..settings()
    }
    .into_config()
    .unwrap();

    let bridge = Bridge::new(config, Arc::new(connector), platform.clone()).unwrap();
    let counters = bridge.counters().clone();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(bridge.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut published = platform.published();
    published.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        published,
        vec![
            ("id:house home/garage".to_string(), json!(7)),
            ("id:house home/kitchen".to_string(), json!(20.5)),
        ]
    );
    assert_eq!(platform.grants.load(Ordering::SeqCst), 2);
    assert_eq!(counters.peek(), CounterSnapshot { success: 2, error: 0 });
    assert_eq!(log.lock().subscriptions, vec!["home/#"]);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bridge_rejects_invalid_transform() {
    let config = BridgeSettings {
        transform: Some("{broken".to_string()),
        ..settings()
    }
    .into_config()
    .unwrap();

    let result = Bridge::new(
        config,
        Arc::new(MockConnector::new(Vec::new())),
        Arc::new(MockPlatform::new()),
    );

    assert!(matches!(result, Err(BridgeError::Transform(TransformError::Compile(_)))));
}

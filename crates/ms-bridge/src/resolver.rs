//! Stream Resolver - maps inbound topics to destination streams
//!
//! The route key for a topic is the stream name template with `$topic`
//! replaced by the (optionally truncated) topic. Each route key is resolved
//! against the platform at most once at a time: the first caller registers a
//! shared pending resolution and every concurrent caller awaits that same
//! future. Successful resolutions stay cached for the life of the process;
//! failed ones are evicted so the next message retries.

use std::sync::Arc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use ms_common::{Principal, StreamHandle, StreamOperation};
use ms_config::TOPIC_PLACEHOLDER;
use ms_platform::StreamPlatform;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::Result;

type PendingResolution = Shared<BoxFuture<'static, Result<StreamHandle>>>;

/// Keep the first `levels + 1` slash-delimited segments of `topic`.
///
/// `None` or a non-positive depth leaves the topic untouched.
pub fn truncate_topic(topic: &str, levels: Option<i32>) -> String {
    match levels {
        Some(levels) if levels > 0 => topic
            .split('/')
            .take(levels as usize + 1)
            .collect::<Vec<_>>()
            .join("/"),
        _ => topic.to_string(),
    }
}

/// How topics become route keys
#[derive(Debug, Clone)]
pub struct RouteRules {
    pub template: String,
    pub topic_levels: Option<i32>,
}

impl Default for RouteRules {
    fn default() -> Self {
        Self {
            template: TOPIC_PLACEHOLDER.to_string(),
            topic_levels: None,
        }
    }
}

impl RouteRules {
    pub fn new(template: impl Into<String>, topic_levels: Option<i32>) -> Self {
        Self {
            template: template.into(),
            topic_levels,
        }
    }

    /// Only the first `$topic` in the template is substituted.
    pub fn route_key(&self, topic: &str) -> String {
        self.template
            .replacen(TOPIC_PLACEHOLDER, &truncate_topic(topic, self.topic_levels), 1)
    }
}

pub struct StreamResolver {
    platform: Arc<dyn StreamPlatform>,
    rules: RouteRules,
    make_public: bool,
    streams: DashMap<String, PendingResolution>,
}

impl StreamResolver {
    pub fn new(platform: Arc<dyn StreamPlatform>, rules: RouteRules, make_public: bool) -> Self {
        Self {
            platform,
            rules,
            make_public,
            streams: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &RouteRules {
        &self.rules
    }

    /// Resolve the destination stream for `topic`.
    pub async fn resolve(&self, topic: &str) -> Result<StreamHandle> {
        self.resolve_key(self.rules.route_key(topic)).await
    }

    /// Resolve a precomputed route key.
    pub async fn resolve_key(&self, route_key: String) -> Result<StreamHandle> {
        // entry() holds the shard lock, so check-and-insert is atomic
        let pending = self
            .streams
            .entry(route_key.clone())
            .or_insert_with(|| self.start_resolution(route_key.clone()))
            .value()
            .clone();

        let result = pending.clone().await;

        if result.is_err() {
            // Only evict our own attempt; a retry may already be registered
            let evicted = self
                .streams
                .remove_if(&route_key, |_, current| current.ptr_eq(&pending))
                .is_some();
            if evicted {
                debug!(route_key = %route_key, "Evicted failed stream resolution");
            }
        }

        result
    }

    /// Completed resolution for `topic`, if any. Never calls the platform.
    pub fn cached(&self, topic: &str) -> Option<StreamHandle> {
        let route_key = self.rules.route_key(topic);
        self.streams
            .get(&route_key)
            .and_then(|pending| match pending.peek() {
                Some(Ok(stream)) => Some(stream.clone()),
                _ => None,
            })
    }

    /// Number of route keys with a pending or completed resolution
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn start_resolution(&self, route_key: String) -> PendingResolution {
        let platform = self.platform.clone();
        let make_public = self.make_public;

        async move {
            info!(stream = %route_key, "Getting or creating stream");
            let stream = platform
                .get_or_create_stream(&route_key)
                .await
                .map_err(|e| BridgeError::resolution(&route_key, e))?;

            if make_public {
                let public_read = platform
                    .has_permission(&stream, StreamOperation::Read, &Principal::Anyone)
                    .await
                    .map_err(|e| BridgeError::resolution(&route_key, e))?;

                if !public_read {
                    info!(stream = %route_key, "Making stream public");
                    platform
                        .grant_permission(&stream, StreamOperation::Read, &Principal::Anyone)
                        .await
                        .map_err(|e| BridgeError::resolution(&route_key, e))?;
                }
            }

            Ok(stream)
        }
        .boxed()
        .shared()
    }
}

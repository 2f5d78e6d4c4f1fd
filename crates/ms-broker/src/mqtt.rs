use std::time::Duration;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tracing::{debug, warn};

use crate::{BrokerConnection, BrokerConnector, BrokerError, BrokerEvent, Result};

/// Pause before polling again after a transport error; rumqttc reconnects on the next poll.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);
const GRACEFUL_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Request slots beyond one per subscribed topic
const REQUEST_CAPACITY: usize = 64;

pub struct MqttConnector {
    client_id: String,
    keep_alive: Duration,
    request_capacity: usize,
}

impl MqttConnector {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            request_capacity: REQUEST_CAPACITY,
        }
    }

    /// Reserve a request slot for every topic so a full subscribe burst
    /// fits before the event loop is polled again.
    pub fn with_topic_count(mut self, topics: usize) -> Self {
        self.request_capacity = REQUEST_CAPACITY + topics;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn options(&self, url: &str) -> Result<MqttOptions> {
        let (address, credentials) = split_userinfo(url);
        let mut options =
            MqttOptions::parse_url(with_client_id(&address, &self.client_id)).map_err(|e| {
                BrokerError::InvalidUrl {
                    url: address.clone(),
                    message: e.to_string(),
                }
            })?;
        options.set_keep_alive(self.keep_alive);
        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }
        Ok(options)
    }
}

/// Strip `user:password@` from the URL authority.
fn split_userinfo(url: &str) -> (String, Option<(String, String)>) {
    let Some(scheme_end) = url.find("://") else {
        return (url.to_string(), None);
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    match authority.rfind('@') {
        Some(at) => {
            let userinfo = &authority[..at];
            let (username, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            let address = format!("{}{}{}", &url[..scheme_end + 3], &authority[at + 1..], &rest[authority_end..]);
            (address, Some((username.to_string(), password.to_string())))
        }
        None => (url.to_string(), None),
    }
}

/// rumqttc takes the client id from the URL query string.
fn with_client_id(url: &str, client_id: &str) -> String {
    if url.contains("client_id=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}client_id={}", url, separator, client_id)
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>> {
        let options = self.options(url)?;
        let (client, eventloop) = AsyncClient::new(options, self.request_capacity);
        Ok(Box::new(MqttConnection {
            client,
            eventloop,
            backoff: false,
        }))
    }
}

pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    backoff: bool,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn next_event(&mut self) -> Option<BrokerEvent> {
        loop {
            if self.backoff {
                tokio::time::sleep(ERROR_RETRY_DELAY).await;
                self.backoff = false;
            }

            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Some(BrokerEvent::Connected);
                    }
                    return Some(BrokerEvent::Error(format!("connection refused: {:?}", ack.code)));
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Some(BrokerEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = ack
                        .return_codes
                        .iter()
                        .map(|code| format!("{:?}", code))
                        .collect();
                    return Some(BrokerEvent::Subscribed { granted });
                }
                Ok(_) => continue,
                Err(e) => {
                    self.backoff = true;
                    return Some(BrokerEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn subscribe(&mut self, topic_pattern: &str) -> Result<()> {
        self.client
            .try_subscribe(topic_pattern, QoS::AtMostOnce)
            .map_err(|e| BrokerError::Subscribe {
                topic: topic_pattern.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(self: Box<Self>, forced: bool) {
        let MqttConnection {
            client,
            mut eventloop,
            ..
        } = *self;

        if forced {
            debug!("Dropping MQTT connection without DISCONNECT");
            return;
        }

        if let Err(e) = client.try_disconnect() {
            warn!("Failed to queue MQTT DISCONNECT: {}", e);
            return;
        }

        // Drive the event loop until the DISCONNECT packet is written
        let flushed = tokio::time::timeout(GRACEFUL_DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("Timed out waiting for MQTT DISCONNECT to flush");
        }
    }
}

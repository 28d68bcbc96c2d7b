//! Broker client: schema-gated publishing over a TLS-capable MQTT session.
//!
//! `connect()` drives the first connection attempt itself so startup can fail
//! fast, then hands the event loop to a background task that keeps the
//! `connected` flag honest. Every publish validates against the topic's
//! schema first; an invalid packet is logged and dropped, never sent.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mqtt::schema::{SchemaError, SchemaSet};

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("broker credentials incomplete: {0}")]
    Credentials(String),

    #[error("broker unreachable: {0}")]
    Connection(String),

    #[error("no schema for topic {0}")]
    NoSchema(String),

    #[error(transparent)]
    Validation(#[from] SchemaError),

    #[error("not connected to broker")]
    NotConnected,

    #[error("publish failed: {0}")]
    Broker(String),
}

/// Broker endpoint and credentials, environment-sourced (the only env
/// consumption in the processor).
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

impl BrokerCredentials {
    pub fn from_env() -> Result<Self, PublishError> {
        let url = std::env::var("ROV_MQTT_URL")
            .map_err(|_| PublishError::Credentials("ROV_MQTT_URL not set".to_string()))?;
        let username = std::env::var("ROV_MQTT_USERNAME")
            .map_err(|_| PublishError::Credentials("ROV_MQTT_USERNAME not set".to_string()))?;
        let password = std::env::var("ROV_MQTT_PASSWORD")
            .map_err(|_| PublishError::Credentials("ROV_MQTT_PASSWORD not set".to_string()))?;
        let client_id = std::env::var("ROV_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| "telemetry-processor".to_string());

        let (host, port, tls) = parse_broker_url(&url)?;
        Ok(BrokerCredentials {
            host,
            port,
            tls,
            username,
            password,
            client_id,
        })
    }
}

/// Accepts `mqtts://host[:port]`, `mqtt://host[:port]` or a bare
/// `host:port`. Bare addresses keep the TLS default of the original
/// deployment.
fn parse_broker_url(url: &str) -> Result<(String, u16, bool), PublishError> {
    let (rest, tls, default_port) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (rest, true, 8883)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (rest, false, 1883)
    } else {
        (url, true, 8883)
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| PublishError::Credentials(format!("bad port in {url}")))?;
            (host.to_string(), port)
        }
        None => (rest.to_string(), default_port),
    };

    if host.is_empty() {
        return Err(PublishError::Credentials(format!("empty host in {url}")));
    }
    Ok((host, port, tls))
}

pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    schemas: Arc<SchemaSet>,
    client_id: String,
}

impl MqttPublisher {
    /// Start the client loop. Fatal if the broker does not accept the session
    /// within one attempt plus a 1 s grace retry.
    pub async fn connect(
        creds: &BrokerCredentials,
        schemas: Arc<SchemaSet>,
    ) -> Result<Self, PublishError> {
        let mut options = MqttOptions::new(&creds.client_id, &creds.host, creds.port);
        options.set_credentials(creds.username.clone(), creds.password.clone());
        options.set_keep_alive(Duration::from_secs(30));
        if creds.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let connected = Arc::new(AtomicBool::new(false));

        // Drive the loop until the session is up; one failed attempt earns a
        // 1 s grace and a second try, then startup aborts.
        let mut failed_attempts = 0u32;
        loop {
            match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    connected.store(true, Ordering::Relaxed);
                    info!(host = %creds.host, port = creds.port, "Connected to MQTT broker");
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    failed_attempts += 1;
                    if failed_attempts > 1 {
                        return Err(PublishError::Connection(e.to_string()));
                    }
                    warn!(error = %e, "Broker connection attempt failed, retrying once");
                    tokio::time::sleep(CONNECT_GRACE).await;
                }
                Err(_) => {
                    return Err(PublishError::Connection(format!(
                        "no ConnAck within {:?}",
                        CONNECT_ATTEMPT_TIMEOUT
                    )));
                }
            }
        }

        // Background loop: keep the session alive and the flag current
        let flag = Arc::clone(&connected);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("MQTT session re-established");
                        flag.store(true, Ordering::Relaxed);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker disconnected the session");
                        flag.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::Relaxed) {
                            warn!(error = %e, "MQTT connection lost, retrying");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(MqttPublisher {
            client,
            connected,
            schemas,
            client_id: creds.client_id.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Validate `packet` against the topic's schema and publish it. An
    /// invalid packet is never sent.
    pub async fn publish(&self, topic: &str, packet: &Value) -> Result<(), PublishError> {
        let schema = self
            .schemas
            .for_topic(topic)
            .ok_or_else(|| PublishError::NoSchema(topic.to_string()))?;

        schema.validate(packet)?;

        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let payload = serde_json::to_vec(packet)
            .map_err(|e| PublishError::Broker(e.to_string()))?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_and_port() {
        assert_eq!(
            parse_broker_url("mqtts://broker.example.com:8883").unwrap(),
            ("broker.example.com".to_string(), 8883, true)
        );
        assert_eq!(
            parse_broker_url("mqtt://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("mqtt://localhost").unwrap(),
            ("localhost".to_string(), 1883, false)
        );
        // Bare host:port keeps the TLS default
        assert_eq!(
            parse_broker_url("broker:9001").unwrap(),
            ("broker".to_string(), 9001, true)
        );
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_broker_url("mqtts://:8883").is_err());
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
    }
}

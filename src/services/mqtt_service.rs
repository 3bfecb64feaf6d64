/// MQTT stream publisher
///
/// Publishes fleet telemetry as JSON payloads to a configured MQTT broker.
/// Topic structure:
///   `{prefix}/{site_id}/telemetry`  one sample per site per tick
///   `{prefix}/{site_id}/alerts`     raised / retracted alert changes
///   `{prefix}/system/summary`       fleet aggregates once per tick
///   `{prefix}/system/status`        retained ONLINE birth, OFFLINE last will
///
/// The event loop runs in its own task and keeps the connection flag in
/// `AppState` current; publishing while disconnected fails fast instead of
/// queueing behind a dead session.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MqttConfig;
use crate::error::{Result, SimError};
use crate::models::alert::AlertChange;
use crate::models::fleet::TelemetrySample;
use crate::services::publisher::{FleetSummary, StreamPublisher};
use crate::shared_state::AppState;

const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct MqttPublisher {
    client: AsyncClient,
    prefix: String,
    state: AppState,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Spawns the event loop; the session comes up in the background.
    pub fn connect(cfg: &MqttConfig, state: AppState) -> Self {
        let client_id = client_id(cfg);
        let prefix = cfg.topic_prefix.trim_end_matches('/').to_string();
        let status_topic = status_topic(&prefix);

        info!(
            "[MQTT] Connecting to {}:{} (client_id={})",
            cfg.broker_host, cfg.broker_port, client_id
        );

        let mut opts = MqttOptions::new(&client_id, &cfg.broker_host, cfg.broker_port);
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_clean_session(true);
        opts.set_last_will(LastWill::new(
            &status_topic,
            status_payload("OFFLINE"),
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);

        let birth_client = client.clone();
        let loop_state = state.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        loop_state.set_publisher_connected(true);
                        match birth_client.try_publish(&status_topic, QoS::AtLeastOnce, true, status_payload("ONLINE")) {
                            Ok(()) => info!("[MQTT] Connected, birth message published to {}", status_topic),
                            Err(e) => warn!("[MQTT] Failed to publish birth message: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[MQTT] Event loop error: {} (will reconnect)", e);
                        loop_state.set_publisher_connected(false);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self { client, prefix, state, event_loop }
    }

    fn send<T: Serialize>(&self, topic: String, payload: &T) -> Result<()> {
        if !self.state.is_publisher_connected() {
            return Err(SimError::PublishUnavailable(format!("broker not connected ({topic})")));
        }
        let bytes = serde_json::to_vec(payload).map_err(|e| SimError::PublishUnavailable(e.to_string()))?;
        self.client
            .try_publish(&topic, QoS::AtLeastOnce, false, bytes)
            .map_err(|e| SimError::PublishUnavailable(format!("{topic}: {e}")))
    }
}

#[async_trait]
impl StreamPublisher for MqttPublisher {
    async fn publish_telemetry(&self, sample: &TelemetrySample) -> Result<()> {
        self.send(telemetry_topic(&self.prefix, &sample.site_id), sample)
    }

    async fn publish_alert(&self, change: &AlertChange) -> Result<()> {
        self.send(alert_topic(&self.prefix, &change.alert().site_id), change)
    }

    async fn publish_summary(&self, summary: &FleetSummary) -> Result<()> {
        self.send(format!("{}/system/summary", self.prefix), summary)
    }

    async fn close(&self) {
        if self.state.is_publisher_connected() {
            let topic = status_topic(&self.prefix);
            if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, true, status_payload("OFFLINE")).await {
                warn!("[MQTT] Failed to publish offline status: {}", e);
            }
            if let Err(e) = self.client.disconnect().await {
                warn!("[MQTT] Disconnect failed: {}", e);
            }
        }
        self.event_loop.abort();
        self.state.set_publisher_connected(false);
        info!("[MQTT] Publisher closed");
    }
}

fn client_id(cfg: &MqttConfig) -> String {
    if cfg.client_id.is_empty() {
        format!("solar-fleet-{}", uuid::Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    }
}

fn telemetry_topic(prefix: &str, site_id: &str) -> String {
    format!("{}/{}/telemetry", prefix, site_id)
}

fn alert_topic(prefix: &str, site_id: &str) -> String {
    format!("{}/{}/alerts", prefix, site_id)
}

fn status_topic(prefix: &str) -> String {
    format!("{}/system/status", prefix)
}

fn status_payload(status: &str) -> Vec<u8> {
    serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_topics() {
        assert_eq!(telemetry_topic("sites", "SCH_WJ_001"), "sites/SCH_WJ_001/telemetry");
        assert_eq!(alert_topic("sites", "SCH_WJ_001"), "sites/SCH_WJ_001/alerts");
        assert_eq!(status_topic("fleet/west"), "fleet/west/system/status");
    }

    #[test]
    fn test_client_id_generated_when_empty() {
        let cfg = MqttConfig::default();
        assert!(client_id(&cfg).starts_with("solar-fleet-"));
        let named = MqttConfig { client_id: "sim-01".into(), ..MqttConfig::default() };
        assert_eq!(client_id(&named), "sim-01");
    }

    #[test]
    fn test_status_payload() {
        let value: serde_json::Value = serde_json::from_slice(&status_payload("ONLINE")).unwrap();
        assert_eq!(value["status"], "ONLINE");
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_unavailable() {
        let cfg = MqttConfig {
            enabled: true,
            broker_host: "127.0.0.1".into(),
            broker_port: 1,
            topic_prefix: "sites/".into(),
            ..MqttConfig::default()
        };
        let state = AppState::new();
        let publisher = MqttPublisher::connect(&cfg, state.clone());
        assert_eq!(publisher.prefix, "sites");

        let sample = TelemetrySample::idle("A", Utc::now(), 0.0, 95.0);
        let err = publisher.publish_telemetry(&sample).await.unwrap_err();
        assert!(matches!(err, SimError::PublishUnavailable(_)));

        publisher.close().await;
        assert!(!state.is_publisher_connected());
    }
}

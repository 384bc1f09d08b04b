use crate::config::Config;
use crate::error::TransportError;
use crate::pipeline::{Dispatcher, InboundMessage, IngestStats};
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        }
    }
}

/// Exponential reconnect delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub fn subscription_filter(topic_root: &str) -> String {
    format!("{topic_root}/+/+/+")
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    if config.mqtt_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Owns the broker connection: connect, subscribe, hand publishes to the
/// dispatcher, and reconnect with backoff until `cancel` fires.
pub async fn run_supervisor(
    config: Config,
    dispatcher: Dispatcher,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) {
    let filter = subscription_filter(&config.topic_root);
    let (initial, max) = config.backoff_bounds();
    let mut backoff = Backoff::new(initial, max);

    loop {
        stats.set_connection_state(ConnectionState::Connecting);
        tracing::info!(host = %config.mqtt_host, port = config.mqtt_port, "connecting to MQTT broker");
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 64);

        let reason = tokio::select! {
            _ = cancel.cancelled() => break,
            reason = pump(
                &client,
                &mut eventloop,
                &filter,
                config.mqtt_qos,
                &dispatcher,
                &stats,
                &mut backoff,
            ) => reason,
        };

        stats.set_connection_state(ConnectionState::Disconnected);
        stats.reconnects.fetch_add(1, Ordering::Relaxed);
        stats.record_error(reason.to_string());
        let delay = backoff.next_delay();
        tracing::warn!(error = %reason, ?delay, "MQTT connection lost; reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    stats.set_connection_state(ConnectionState::Disconnected);
    tracing::info!("ingestion supervisor stopped");
}

/// Drives one connection until it fails.
async fn pump(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    filter: &str,
    qos: QoS,
    dispatcher: &Dispatcher,
    stats: &IngestStats,
    backoff: &mut Backoff,
) -> TransportError {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                backoff.reset();
                if let Err(err) = client.subscribe(filter, qos).await {
                    return TransportError::Client(err);
                }
                stats.set_connection_state(ConnectionState::Connected);
                stats.clear_error();
                tracing::info!(
                    topic = %filter,
                    session_present = ack.session_present,
                    "subscribed to device telemetry"
                );
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                dispatcher.dispatch(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    received_at: Utc::now(),
                });
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return TransportError::Refused(code),
            Err(err) => return TransportError::Connection(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{spawn_shards, ShardSettings};
    use crate::policy::tests::sample_policy;
    use crate::router::{DeviceDirectory, TopicRouter};
    use crate::rules::RuleEngine;
    use crate::sink::{spawn_writer, EventStore, MemoryEventLog, SinkSettings};
    use crate::telemetry::MessageDecoder;
    use std::collections::HashMap;

    #[test]
    fn backoff_doubles_up_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn connection_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
        assert_eq!(ConnectionState::from_u8(42), ConnectionState::Disconnected);
    }

    #[test]
    fn subscribes_to_every_device_channel_under_the_root() {
        assert_eq!(subscription_filter("plant"), "plant/+/+/+");
    }

    #[tokio::test]
    async fn cancellation_stops_reconnect_loop() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgresql://localhost/ro"),
            ("DIAG_POLICY_PATH", "/dev/null"),
            ("MQTT_HOST", "127.0.0.1"),
            ("MQTT_PORT", "1"),
            ("DIAG_BACKOFF_INITIAL_MS", "10"),
            ("DIAG_BACKOFF_MAX_MS", "20"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_source(|key| vars.get(key).map(|v| v.to_string())).expect("config");

        let policy = sample_policy();
        let stats = Arc::new(IngestStats::new());
        let (sink, _writer) = spawn_writer(
            EventStore::Memory(Arc::new(MemoryEventLog::new())),
            SinkSettings {
                queue: 8,
                batch_size: 8,
                flush_interval: Duration::from_secs(60),
                max_attempts: 1,
                retry_base: Duration::from_millis(1),
            },
            stats.clone(),
        );
        let (_shards, dispatcher, _workers) = spawn_shards(
            &ShardSettings {
                workers: 1,
                queue: 8,
                window_capacity: policy.window_capacity,
                stale_after: policy.stale_after,
                offline_after: policy.offline_after,
            },
            TopicRouter::new("plant", DeviceDirectory::fixed(Vec::new())),
            MessageDecoder::new(policy.channels.clone()),
            Arc::new(RuleEngine::new(policy.rules.clone())),
            sink,
            EventStore::Memory(Arc::new(MemoryEventLog::new())),
            stats.clone(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_supervisor(config, dispatcher, stats.clone(), cancel.clone()));
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("supervisor stops on cancel")
            .expect("supervisor task");
        assert_eq!(stats.connection_state(), ConnectionState::Disconnected);
        assert!(stats.reconnects.load(Ordering::Relaxed) >= 1);
    }
}

//! MQTT subscriber for receiver instances.
//!
//! Each configured instance publishes spots on `{topic_prefix}/wspr/spot`.
//! One client subscribes to all of them, tags each parsed spot with the
//! instance that owns the topic and offers it to the aggregator.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::aggregator::SpotIngest;
use crate::config::MqttConfig;
use crate::error::{Error, Result};
use crate::parser::parse_spot_payload;
use crate::stats::StatsTracker;

/// Default broker port when the URI omits one.
pub const DEFAULT_PORT: u16 = 1883;

/// How long the first connection may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Split a broker URI such as `tcp://host:1883` into host and port.
pub fn parse_broker(uri: &str) -> Result<(String, u16)> {
    let uri = uri.trim();
    let rest = match uri.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::ConfigInvalid(format!(
                "unsupported broker scheme: {}",
                scheme
            )));
        }
        None => uri,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::ConfigInvalid(format!("invalid broker port: {}", port)))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(Error::ConfigInvalid(format!("missing broker host: {}", uri)));
    }
    Ok((host.to_string(), port))
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Maps spot topics to instance names and forwards parsed spots.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: HashMap<String, String>,
    ingest: SpotIngest,
    stats: Arc<StatsTracker>,
}

impl TopicRouter {
    pub fn new(config: &MqttConfig, ingest: SpotIngest, stats: Arc<StatsTracker>) -> Self {
        let routes = config
            .instances
            .iter()
            .map(|i| (i.spot_topic(), i.name.clone()))
            .collect();
        Self {
            routes,
            ingest,
            stats,
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Parse one publish and offer it to the aggregator.
    ///
    /// Returns `true` if the spot was queued.
    pub fn route(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(instance) = self.routes.get(topic) else {
            debug!("Ignoring message on unexpected topic {}", topic);
            return false;
        };

        match parse_spot_payload(payload, instance) {
            Ok(spot) => {
                debug!("Spot from {}: {}", instance, spot);
                self.ingest.offer(spot).is_ok()
            }
            Err(e) => {
                self.stats.record_parse_failure();
                debug!("Bad payload on {}: {}", topic, e);
                false
            }
        }
    }
}

/// MQTT connection driving a [`TopicRouter`].
pub struct MqttSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    router: TopicRouter,
    qos: QoS,
}

impl MqttSubscriber {
    pub fn new(config: &MqttConfig, router: TopicRouter) -> Result<Self> {
        let (host, port) = parse_broker(&config.broker)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        Ok(Self {
            client,
            eventloop,
            router,
            qos: qos(config.qos),
        })
    }

    fn subscribe_all(&self) {
        for topic in self.router.topics() {
            match self.client.try_subscribe(topic, self.qos) {
                Ok(()) => info!("Subscribed to {}", topic),
                Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
            }
        }
    }

    /// Wait for the first CONNACK. Failure here is fatal to startup.
    async fn wait_connected(&mut self) -> Result<()> {
        let connect = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(Error::TransportTransient(e.to_string())),
                }
            }
        };
        timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::TransportTransient("connect timeout".to_string()))?
    }

    /// Connect, subscribe and spawn the receive loop.
    ///
    /// Reconnects after the first successful connection are retried forever.
    pub async fn start(mut self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        self.wait_connected().await?;
        info!("Connected to MQTT broker");
        self.subscribe_all();
        Ok(tokio::spawn(self.run(shutdown)))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.router.route(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Reconnected to MQTT broker");
                        self.subscribe_all();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        info!("Reconnecting in {} seconds...", RECONNECT_DELAY.as_secs());
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                },
            }
        }

        let _ = self.client.try_disconnect();
        info!("MQTT subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use tokio::sync::mpsc;

    fn config() -> MqttConfig {
        MqttConfig {
            instances: vec![
                InstanceConfig {
                    name: "kiwi-a".to_string(),
                    topic_prefix: "kiwi/a".to_string(),
                },
                InstanceConfig {
                    name: "kiwi-b".to_string(),
                    topic_prefix: "kiwi/b/".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_broker() {
        assert_eq!(
            parse_broker("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("mqtt://broker.example.com").unwrap(),
            ("broker.example.com".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_broker("10.0.0.5:11883").unwrap(),
            ("10.0.0.5".to_string(), 11883)
        );
        assert!(matches!(
            parse_broker("ws://localhost:9001"),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            parse_broker("tcp://localhost:http"),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(parse_broker("tcp://:1883"), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_route_tags_instance() {
        let stats = Arc::new(StatsTracker::new("FN42"));
        let (tx, mut rx) = mpsc::channel(8);
        let router = TopicRouter::new(&config(), SpotIngest::new(tx, Arc::clone(&stats)), stats);

        let payload = br#"{"callsign":"G0XYZ","grid":"IO91","snr":-10,
            "frequency":14097050,"epoch_time":"2024-06-01T12:00:00Z"}"#;
        assert!(router.route("kiwi/b/wspr/spot", payload));

        let spot = rx.recv().await.unwrap();
        assert_eq!(spot.instance_name, "kiwi-b");
        assert_eq!(spot.callsign, "G0XYZ");
    }

    #[tokio::test]
    async fn test_route_counts_bad_payloads() {
        let stats = Arc::new(StatsTracker::new("FN42"));
        let (tx, mut rx) = mpsc::channel(8);
        let router = TopicRouter::new(&config(), SpotIngest::new(tx, Arc::clone(&stats)), Arc::clone(&stats));

        assert!(!router.route("kiwi/a/wspr/spot", b"{not json"));
        assert!(!router.route("kiwi/a/wspr/spot", br#"{"callsign":"G0XYZ"}"#));
        assert!(!router.route("kiwi/c/wspr/spot", b"{}"));

        assert_eq!(stats.totals().parse_failures, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_topics() {
        let stats = Arc::new(StatsTracker::new("FN42"));
        let (tx, _rx) = mpsc::channel(1);
        let router = TopicRouter::new(&config(), SpotIngest::new(tx, Arc::clone(&stats)), stats);

        let mut topics: Vec<&str> = router.topics().collect();
        topics.sort();
        assert_eq!(topics, vec!["kiwi/a/wspr/spot", "kiwi/b/wspr/spot"]);
    }
}

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::{Outgoing, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{detect_topic, DetectionEvent};

/// Fire-and-forget live detection channel.
pub trait DetectionSink: Send + Sync {
    fn publish(&self, event: &DetectionEvent) -> Result<()>;
}

/// In-process fan-out keyed by detection topic.
#[derive(Default)]
pub struct DetectionBus {
    subscribers: Mutex<HashMap<String, Vec<Sender<DetectionEvent>>>>,
}

impl DetectionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every detection published for `camera_id` from now on.
    pub fn subscribe(&self, camera_id: &str) -> Result<Receiver<DetectionEvent>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .map_err(|_| anyhow!("detection bus lock poisoned"))?
            .entry(detect_topic(camera_id))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    pub fn subscriber_count(&self, camera_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(&detect_topic(camera_id)).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl DetectionSink for DetectionBus {
    fn publish(&self, event: &DetectionEvent) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| anyhow!("detection bus lock poisoned"))?;
        let topic = event.topic();
        if let Some(listeners) = subscribers.get_mut(&topic) {
            listeners.retain(|tx| tx.send(event.clone()).is_ok());
            if listeners.is_empty() {
                subscribers.remove(&topic);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Accepts `host:port`, `mqtt://host:port`, `mqtts://host:port`.
    pub fn parse(addr: &str) -> Result<Self> {
        let mut use_tls = false;
        let mut remainder = addr.trim();
        if let Some((scheme, rest)) = remainder.split_once("://") {
            match scheme {
                "mqtt" | "tcp" => {}
                "mqtts" | "ssl" => use_tls = true,
                other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
            }
            remainder = rest;
        }
        let (host, port) = split_host_port(remainder)?;
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

/// Pause between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CLOSE_POLL: Duration = Duration::from_millis(100);

/// Publishes detection events as JSON to `<prefix>/<camera-id>-detect` at QoS 0.
///
/// The connection thread keeps reconnecting after broker errors until
/// `disconnect` is called (or the sink is dropped).
pub struct MqttDetectionSink {
    client: Mutex<Option<Client>>,
    topic_prefix: String,
    closing: Arc<AtomicBool>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl MqttDetectionSink {
    pub fn connect(endpoint: &MqttEndpoint, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let closing = Arc::new(AtomicBool::new(false));
        let closing_thread = closing.clone();
        let handle = std::thread::Builder::new()
            .name("mqtt-detections".to_string())
            .spawn(move || drive_connection(connection, &closing_thread))
            .context("spawn MQTT connection thread")?;
        log::info!(
            "publishing detections to MQTT {}:{} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            client: Mutex::new(Some(client)),
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            closing,
            connection: Mutex::new(Some(handle)),
        })
    }

    pub fn topic_for(&self, event: &DetectionEvent) -> String {
        format!("{}/{}", self.topic_prefix, event.topic())
    }

    /// Send a DISCONNECT, stop reconnecting and wait for the connection
    /// thread. Later publishes fail. Calling it again is a no-op.
    pub fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let client = self
            .client
            .lock()
            .map_err(|_| anyhow!("MQTT client lock poisoned"))?
            .take();
        if let Some(client) = client {
            if let Err(e) = client.try_disconnect() {
                log::debug!("MQTT disconnect not queued: {}", e);
            }
            // Dropping the last client ends the connection iterator once
            // queued requests are flushed.
            drop(client);
        }
        let handle = self
            .connection
            .lock()
            .map_err(|_| anyhow!("MQTT connection lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("MQTT connection thread panicked"))?;
        }
        Ok(())
    }

    /// Whether the connection thread is still polling the broker.
    pub fn connection_running(&self) -> bool {
        self.connection
            .lock()
            .map(|handle| handle.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl DetectionSink for MqttDetectionSink {
    fn publish(&self, event: &DetectionEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("serialize detection event")?;
        let client = self
            .client
            .lock()
            .map_err(|_| anyhow!("MQTT client lock poisoned"))?;
        let client = client
            .as_ref()
            .ok_or_else(|| anyhow!("MQTT detection sink is disconnected"))?;
        client
            .try_publish(self.topic_for(event), QoS::AtMostOnce, false, payload)
            .context("queue MQTT detection publish")?;
        Ok(())
    }
}

impl Drop for MqttDetectionSink {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            log::warn!("{:#}", err);
        }
    }
}

/// Polls the connection until the sink closes. Errors are logged and the
/// next poll reconnects.
fn drive_connection(mut connection: Connection, closing: &AtomicBool) {
    for event in connection.iter() {
        match event {
            Ok(Event::Outgoing(Outgoing::Disconnect)) if closing.load(Ordering::SeqCst) => break,
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(_) if closing.load(Ordering::SeqCst) => break,
            Err(e) => {
                log::warn!(
                    "MQTT connection error: {}; reconnecting in {:?}",
                    e,
                    RECONNECT_DELAY
                );
                if wait_or_close(closing, RECONNECT_DELAY) {
                    break;
                }
            }
        }
    }
    log::debug!("MQTT connection thread stopped");
}

/// Sleeps up to `delay`. Returns true if the sink started closing meanwhile.
fn wait_or_close(closing: &AtomicBool, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if closing.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(CLOSE_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
    closing.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, Prediction};

    fn event(camera_id: &str) -> DetectionEvent {
        DetectionEvent {
            camera_id: camera_id.to_string(),
            predictions: vec![Prediction {
                label: "person".to_string(),
                bbox: BoundingBox::new(1, 2, 3, 4),
                detected_on_ms: 1_700_000_000_000,
                image_width: 640,
                image_height: 360,
            }],
        }
    }

    #[test]
    fn bus_delivers_only_to_matching_topic() {
        let bus = DetectionBus::new();
        let front = bus.subscribe("front").unwrap();
        let back = bus.subscribe("back").unwrap();

        bus.publish(&event("front")).unwrap();
        assert_eq!(front.try_recv().unwrap().camera_id, "front");
        assert!(back.try_recv().is_err());
    }

    #[test]
    fn bus_prunes_dropped_subscribers() {
        let bus = DetectionBus::new();
        let rx = bus.subscribe("front").unwrap();
        assert_eq!(bus.subscriber_count("front"), 1);
        drop(rx);
        bus.publish(&event("front")).unwrap();
        assert_eq!(bus.subscriber_count("front"), 0);
    }

    #[test]
    fn parse_mqtt_endpoints() {
        let plain = MqttEndpoint::parse("mqtt://127.0.0.1:1883").unwrap();
        assert_eq!(plain.host, "127.0.0.1");
        assert_eq!(plain.port, 1883);
        assert!(!plain.use_tls);

        let tls = MqttEndpoint::parse("mqtts://broker.local:8883").unwrap();
        assert!(tls.use_tls);

        let v6 = MqttEndpoint::parse("[::1]:1883").unwrap();
        assert_eq!(v6.host, "::1");

        assert!(MqttEndpoint::parse("broker.local").is_err());
        assert!(MqttEndpoint::parse("ws://broker.local:80").is_err());
    }

    fn unused_local_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn mqtt_sink_keeps_reconnecting_after_broker_errors() {
        // A "broker" that accepts and immediately hangs up.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let endpoint = MqttEndpoint::parse(&format!("127.0.0.1:{}", port)).unwrap();
        let sink = MqttDetectionSink::connect(&endpoint, "watchd-test", "watch").unwrap();
        let deadline = Instant::now() + Duration::from_secs(15);
        while accepted.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "sink never reconnected");
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(sink.connection_running());

        let started = Instant::now();
        sink.disconnect().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!sink.connection_running());
    }

    #[test]
    fn disconnect_stops_thread_and_rejects_later_publishes() {
        let endpoint = MqttEndpoint::parse(&format!("127.0.0.1:{}", unused_local_port())).unwrap();
        let sink = MqttDetectionSink::connect(&endpoint, "watchd-test", "watch/").unwrap();
        assert_eq!(sink.topic_for(&event("front")), "watch/front-detect");
        std::thread::sleep(Duration::from_millis(200));
        assert!(sink.connection_running());

        sink.disconnect().unwrap();
        assert!(!sink.connection_running());
        assert!(sink.publish(&event("front")).is_err());
        sink.disconnect().unwrap();
    }

    #[test]
    fn reconnect_wait_ends_early_when_closing() {
        let closing = AtomicBool::new(true);
        let started = Instant::now();
        assert!(wait_or_close(&closing, Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!wait_or_close(&AtomicBool::new(false), Duration::from_millis(10)));
    }

    #[test]
    fn event_payload_flattens_boxes() {
        let json = serde_json::to_value(event("front")).unwrap();
        let first = &json["predictions"][0];
        assert_eq!(first["x"], 1);
        assert_eq!(first["height"], 4);
        assert_eq!(first["label"], "person");
    }
}

use crate::core::{decode_payload, StreamItem, StreamType};
use crate::sources::stream_source::{ChannelSource, StreamSource};
use crate::{Error, Result};
use log::{debug, info, warn};
use rumqttc::{Client, ConnectionError, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for an MQTT-fed stream
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub topic: String,
}

impl Default for MqttSourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "confluence_subscriber".to_string(),
            keep_alive_secs: 30,
            topic: "sensors".to_string(),
        }
    }
}

/// Subscribes to one topic and decodes each JSON payload into a record of
/// `stream_type`. Only a payload carrying the end-of-stream marker ends the
/// stream; connection errors are retried with back-off and the topic is
/// subscribed again once the broker accepts the new connection.
pub struct MqttSource {
    client: Client,
    inner: ChannelSource,
    should_stop: Arc<AtomicBool>,
}

impl MqttSource {
    pub fn connect(config: &MqttSourceConfig, stream_type: StreamType) -> Result<Self> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, mut connection) = Client::new(mqtt_options, 100);
        client
            .subscribe(&config.topic, QoS::AtLeastOnce)
            .map_err(|e| Error::Source(format!("subscription to {} failed: {}", config.topic, e)))?;
        info!(
            "Subscribed stream {} to {} on {}:{}",
            stream_type.name, config.topic, config.host, config.port
        );

        let (sender, inner) = ChannelSource::new(&stream_type.name);
        let should_stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&should_stop);

        let resubscriber = client.clone();
        let topic = config.topic.clone();

        // Handles incoming messages until the stream ends; dropping the
        // sender closes the channel source.
        thread::spawn(move || {
            let mut backoff = INITIAL_BACKOFF;
            let mut reconnecting = false;
            for notification in connection.iter() {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match deliver(notification, &stream_type, &sender) {
                    Delivery::Continue => backoff = INITIAL_BACKOFF,
                    Delivery::Connected => {
                        backoff = INITIAL_BACKOFF;
                        if reconnecting {
                            reconnecting = false;
                            info!("Reconnected stream {}, subscribing to {} again", stream_type.name, topic);
                            if let Err(e) = resubscriber.try_subscribe(&topic, QoS::AtLeastOnce) {
                                warn!("Resubscription to {} failed: {}", topic, e);
                            }
                        }
                    }
                    Delivery::Retry => {
                        reconnecting = true;
                        thread::sleep(backoff);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                    Delivery::Finished => break,
                }
            }
        });

        Ok(MqttSource { client, inner, should_stop })
    }

    pub fn stop(&self) -> Result<()> {
        self.should_stop.store(true, Ordering::Relaxed);
        self.client.disconnect().map_err(|e| Error::Source(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Continue,
    /// The broker accepted a (re)connection.
    Connected,
    /// The connection failed; polling again reconnects.
    Retry,
    /// End-of-stream marker received or the consumer is gone.
    Finished,
}

fn deliver(
    notification: std::result::Result<Event, ConnectionError>,
    stream_type: &StreamType,
    sender: &UnboundedSender<StreamItem>,
) -> Delivery {
    let publish = match notification {
        Ok(Event::Incoming(Packet::Publish(publish))) => publish,
        Ok(Event::Incoming(Packet::ConnAck(_))) => return Delivery::Connected,
        Ok(_) => return Delivery::Continue,
        Err(e) => {
            warn!("MQTT connection error on {}, retrying: {:?}", stream_type.name, e);
            return Delivery::Retry;
        }
    };

    match decode_payload(&publish.payload, stream_type) {
        Ok(StreamItem::EndOfStream) => {
            debug!("End-of-stream marker received on {}", publish.topic);
            Delivery::Finished
        }
        Ok(item) => {
            if sender.send(item).is_err() {
                Delivery::Finished
            } else {
                Delivery::Continue
            }
        }
        Err(e) => {
            warn!("Dropping payload on {}: {}", publish.topic, e);
            Delivery::Continue
        }
    }
}

impl StreamSource for MqttSource {
    fn stream_name(&self) -> &str {
        self.inner.stream_name()
    }

    fn poll_next(&mut self) -> Result<Option<StreamItem>> {
        self.inner.poll_next()
    }
}

impl Drop for MqttSource {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        let _ = self.client.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Scalar, ScalarType};
    use rumqttc::Publish;
    use std::io;

    fn publish(payload: &str) -> std::result::Result<Event, ConnectionError> {
        let packet = Publish::new("sensors", QoS::AtLeastOnce, payload.as_bytes().to_vec());
        Ok(Event::Incoming(Packet::Publish(packet)))
    }

    #[test]
    fn test_connection_error_does_not_end_stream() {
        let stream_type = StreamType::new("Speed").field("k", ScalarType::Int);
        let (sender, mut source) = ChannelSource::new("Speed");

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "broker went away");
        assert_eq!(deliver(Err(ConnectionError::Io(reset)), &stream_type, &sender), Delivery::Retry);
        assert_eq!(source.poll_next().unwrap(), None);

        assert_eq!(deliver(publish(r#"{"k": 7}"#), &stream_type, &sender), Delivery::Continue);
        match source.poll_next().unwrap() {
            Some(StreamItem::Record(record)) => assert_eq!(record.get("k"), Some(&Scalar::Int(7))),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_end_of_stream_marker_finishes() {
        let stream_type = StreamType::new("Speed").field("k", ScalarType::Int);
        let (sender, _source) = ChannelSource::new("Speed");

        assert_eq!(deliver(publish("not json"), &stream_type, &sender), Delivery::Continue);
        assert_eq!(
            deliver(publish(r#"{"__eos__": true}"#), &stream_type, &sender),
            Delivery::Finished
        );
    }
}

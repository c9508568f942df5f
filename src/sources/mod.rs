//! Record sources: in-memory queues, channels, JSON-lines files and MQTT.

pub mod file_source;
pub mod mqtt_adapter;
pub mod stream_source;

pub use file_source::FileSource;
pub use mqtt_adapter::{MqttSource, MqttSourceConfig};
pub use stream_source::{ChannelSource, MemorySource, StreamSource};

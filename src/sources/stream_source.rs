use crate::core::{StreamItem, StreamRecord};
use crate::Result;
use std::collections::VecDeque;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// A pull-based producer of one stream's items.
pub trait StreamSource: Send {
    /// Name of the stream this source feeds.
    fn stream_name(&self) -> &str;

    /// Next available item. `Ok(None)` means nothing is available right now;
    /// the caller polls again later. After yielding `EndOfStream` a source
    /// only returns `Ok(None)`.
    fn poll_next(&mut self) -> Result<Option<StreamItem>>;
}

/// Pre-loaded items, delivered in order.
pub struct MemorySource {
    stream: String,
    items: VecDeque<StreamItem>,
}

impl MemorySource {
    pub fn new(stream: &str, records: impl IntoIterator<Item = StreamRecord>) -> Self {
        MemorySource {
            stream: stream.to_string(),
            items: records.into_iter().map(StreamItem::Record).collect(),
        }
    }

    /// Append an end-of-stream after the loaded records.
    pub fn closing(mut self) -> Self {
        self.items.push_back(StreamItem::EndOfStream);
        self
    }

    pub fn push(&mut self, item: StreamItem) {
        self.items.push_back(item);
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl StreamSource for MemorySource {
    fn stream_name(&self) -> &str {
        &self.stream
    }

    fn poll_next(&mut self) -> Result<Option<StreamItem>> {
        Ok(self.items.pop_front())
    }
}

/// Source fed from other threads through an unbounded channel. Dropping every
/// sender ends the stream.
pub struct ChannelSource {
    stream: String,
    receiver: UnboundedReceiver<StreamItem>,
    finished: bool,
}

impl ChannelSource {
    pub fn new(stream: &str) -> (UnboundedSender<StreamItem>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, ChannelSource { stream: stream.to_string(), receiver, finished: false })
    }
}

impl StreamSource for ChannelSource {
    fn stream_name(&self) -> &str {
        &self.stream
    }

    fn poll_next(&mut self) -> Result<Option<StreamItem>> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.try_recv() {
            Ok(StreamItem::EndOfStream) | Err(TryRecvError::Disconnected) => {
                self.finished = true;
                self.receiver.close();
                Ok(Some(StreamItem::EndOfStream))
            }
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_order_and_close() {
        let mut source = MemorySource::new(
            "A",
            vec![StreamRecord::new("A").with("k", 1), StreamRecord::new("A").with("k", 2)],
        )
        .closing();

        assert_eq!(source.remaining(), 3);
        let first = source.poll_next().unwrap().unwrap();
        assert_eq!(first, StreamItem::Record(StreamRecord::new("A").with("k", 1)));
        source.poll_next().unwrap();
        assert_eq!(source.poll_next().unwrap(), Some(StreamItem::EndOfStream));
        assert_eq!(source.poll_next().unwrap(), None);
    }

    #[test]
    fn test_channel_source_disconnect_is_end_of_stream() {
        let (sender, mut source) = ChannelSource::new("A");
        assert_eq!(source.poll_next().unwrap(), None);

        let producer = std::thread::spawn(move || {
            sender.send(StreamRecord::new("A").with("k", 7).into()).unwrap();
        });
        producer.join().unwrap();

        assert!(matches!(source.poll_next().unwrap(), Some(StreamItem::Record(_))));
        assert_eq!(source.poll_next().unwrap(), Some(StreamItem::EndOfStream));
        assert_eq!(source.poll_next().unwrap(), None);
    }
}

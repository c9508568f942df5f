//! Destinations for pipeline output.

use crate::core::{encode_eos, encode_record, StreamRecord};
use crate::{Error, Result};
use std::io::Write;

/// Receives processed records on a named output stream.
pub trait Sink {
    fn emit(&mut self, stream: &str, record: StreamRecord) -> Result<()>;

    /// The output stream is complete.
    fn end_of_stream(&mut self, stream: &str) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub records: Vec<(String, StreamRecord)>,
    pub closed: Vec<String>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_of<'a>(&'a self, stream: &'a str) -> impl Iterator<Item = &'a StreamRecord> {
        self.records.iter().filter(move |(s, _)| s == stream).map(|(_, record)| record)
    }

    pub fn is_closed(&self, stream: &str) -> bool {
        self.closed.iter().any(|s| s == stream)
    }
}

impl Sink for CollectingSink {
    fn emit(&mut self, stream: &str, record: StreamRecord) -> Result<()> {
        self.records.push((stream.to_string(), record));
        Ok(())
    }

    fn end_of_stream(&mut self, stream: &str) -> Result<()> {
        self.closed.push(stream.to_string());
        Ok(())
    }
}

/// Writes one JSON object per line: `{"stream": ..., "fields": {...}}`, and
/// `{"stream": ..., "__eos__": true}` at the end.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_value(&mut self, value: &serde_json::Value) -> Result<()> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b"\n").map_err(|e| Error::Sink(e.to_string()))
    }
}

impl<W: Write> Sink for JsonLinesSink<W> {
    fn emit(&mut self, stream: &str, record: StreamRecord) -> Result<()> {
        self.write_value(&encode_record(stream, &record))?;
        self.written += 1;
        Ok(())
    }

    fn end_of_stream(&mut self, stream: &str) -> Result<()> {
        self.write_value(&encode_eos(stream))?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| Error::Sink(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_output() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit("joined", StreamRecord::new("joined").with("Location.time", 0)).unwrap();
        sink.end_of_stream("joined").unwrap();
        assert_eq!(sink.written(), 1);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"fields":{"Location.time":0},"stream":"joined"}"#);
        assert_eq!(lines[1], r#"{"__eos__":true,"stream":"joined"}"#);
    }

    #[test]
    fn test_collecting_sink() {
        let mut sink = CollectingSink::new();
        sink.emit("out", StreamRecord::new("out").with("k", 1)).unwrap();
        sink.emit("other", StreamRecord::new("other").with("k", 2)).unwrap();
        sink.end_of_stream("out").unwrap();

        assert_eq!(sink.records_of("out").count(), 1);
        assert!(sink.is_closed("out"));
        assert!(!sink.is_closed("other"));
    }
}

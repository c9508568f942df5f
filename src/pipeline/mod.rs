//! The driving loop: polls every source in turn, feeds the join engine, hands
//! joined tuples to a processor and writes its output to a sink.
//!
//! When the root stream declares a tumbling window, tuples are grouped by the
//! window their root record falls into and the processor sees one
//! [`WindowBatch`] per window instead of single tuples.

use crate::core::{StreamItem, StreamRecord};
use crate::sinks::Sink;
use crate::sources::StreamSource;
use crate::stream::{
    EngineConfig, EngineMetrics, EngineState, JoinEngine, JoinedTuple, UnmatchedRecords,
};
use crate::topology::{JoinTree, JoinTreeNode};
use crate::{Error, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stream name under which processed records are emitted.
    pub output_stream: String,
    /// Items taken from one source before moving to the next.
    pub records_per_turn: usize,
    /// Sleep after a pass in which no source had anything.
    pub idle_backoff_ms: u64,
    /// End the run after this many consecutive idle passes.
    pub max_idle_polls: Option<u64>,
    pub engine: EngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_stream: "joined".to_string(),
            records_per_turn: 1,
            idle_backoff_ms: 10,
            max_idle_polls: None,
            engine: EngineConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// What a processor makes of one joined tuple or window.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutput {
    Skip,
    Record(StreamRecord),
    Records(Vec<StreamRecord>),
    /// End the run after this tuple.
    Stop,
}

/// The tuples of one tumbling window, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowBatch {
    root: String,
    pub key: i64,
    pub size: u64,
    pub tuples: Vec<JoinedTuple>,
}

impl WindowBatch {
    fn open(root: &JoinTreeNode, key: i64, first: JoinedTuple) -> Self {
        WindowBatch {
            root: root.name().to_string(),
            key,
            size: root.tumbling.unwrap_or(1),
            tuples: vec![first],
        }
    }

    /// Lowest ordering value covered by the window.
    pub fn start(&self) -> i64 {
        self.key.saturating_mul(i64::try_from(self.size).unwrap_or(i64::MAX))
    }

    /// Distinct root records of the window, in order of first appearance.
    pub fn roots(&self) -> Vec<&StreamRecord> {
        let mut roots: Vec<&StreamRecord> = Vec::new();
        for record in self.tuples.iter().filter_map(|tuple| tuple.get(&self.root)) {
            if !roots.iter().any(|seen| seen.sequence == record.sequence) {
                roots.push(record);
            }
        }
        roots
    }
}

pub trait Processor {
    fn process(&mut self, tuple: &JoinedTuple) -> Result<ProcessOutput>;

    /// Handle a closed tumbling window. By default each tuple goes through
    /// [`Processor::process`] and the records are emitted together; a `Stop`
    /// from any tuple ends the run without emitting the window.
    fn process_window(&mut self, batch: &WindowBatch) -> Result<ProcessOutput> {
        let mut records = Vec::new();
        for tuple in &batch.tuples {
            match self.process(tuple)? {
                ProcessOutput::Skip => {}
                ProcessOutput::Record(record) => records.push(record),
                ProcessOutput::Records(more) => records.extend(more),
                ProcessOutput::Stop => return Ok(ProcessOutput::Stop),
            }
        }
        Ok(if records.is_empty() { ProcessOutput::Skip } else { ProcessOutput::Records(records) })
    }
}

impl<F> Processor for F
where
    F: FnMut(&JoinedTuple) -> Result<ProcessOutput>,
{
    fn process(&mut self, tuple: &JoinedTuple) -> Result<ProcessOutput> {
        self(tuple)
    }
}

/// Merge a tuple into one record whose fields are named `Stream.field`.
pub fn flatten_tuple(tuple: &JoinedTuple, output_stream: &str) -> StreamRecord {
    let mut record = StreamRecord::new(output_stream);
    for (stream, part) in tuple.records() {
        for (field, value) in &part.fields {
            record.fields.insert(format!("{}.{}", stream, field), value.clone());
        }
    }
    record.timestamp = tuple.records().filter_map(|(_, part)| part.timestamp).max();
    record
}

/// Emits every tuple flattened with [`flatten_tuple`].
pub struct FlattenProcessor {
    output_stream: String,
}

impl FlattenProcessor {
    pub fn new(output_stream: &str) -> Self {
        Self { output_stream: output_stream.to_string() }
    }
}

impl Processor for FlattenProcessor {
    fn process(&mut self, tuple: &JoinedTuple) -> Result<ProcessOutput> {
        Ok(ProcessOutput::Record(flatten_tuple(tuple, &self.output_stream)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every input stream ended.
    Terminated,
    /// The processor asked to stop.
    Stopped,
    /// No input arrived for the configured number of polls.
    Idle,
    /// The stop flag was raised.
    Cancelled,
}

/// Metrics collected by a pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PipelineMetrics {
    pub records_read: u64,
    pub end_of_streams: u64,
    pub tuples_joined: u64,
    pub windows_processed: u64,
    pub records_emitted: u64,
    /// Tuples, or windows, for which the processor emitted nothing.
    pub tuples_skipped: u64,
    pub elapsed_seconds: f64,
}

impl PipelineMetrics {
    pub fn records_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.records_read as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    pub fn tuples_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.tuples_joined as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Joined tuples per input record, in percent.
    pub fn join_rate(&self) -> f64 {
        if self.records_read > 0 {
            (self.tuples_joined as f64 / self.records_read as f64) * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    pub metrics: PipelineMetrics,
    pub engine: EngineMetrics,
    /// Records that never joined; filled only when every input ended.
    pub unmatched: UnmatchedRecords,
}

impl PipelineReport {
    pub fn unmatched_count(&self) -> usize {
        self.unmatched.values().map(Vec::len).sum()
    }
}

pub struct JoinPipeline<P: Processor, S: Sink> {
    engine: JoinEngine,
    sources: Vec<Box<dyn StreamSource>>,
    processor: P,
    sink: S,
    config: PipelineConfig,
    should_stop: Arc<AtomicBool>,
    /// Root node, when it declares a tumbling window.
    windowing: Option<JoinTreeNode>,
    pending_window: Option<WindowBatch>,
}

impl<P: Processor, S: Sink> JoinPipeline<P, S> {
    pub fn new(tree: JoinTree, processor: P, sink: S, config: PipelineConfig) -> Self {
        let engine = JoinEngine::new(tree, config.engine.clone());
        Self::with_engine(engine, processor, sink, config)
    }

    /// Use a pre-configured engine, e.g. one with an overflow listener.
    pub fn with_engine(engine: JoinEngine, processor: P, sink: S, config: PipelineConfig) -> Self {
        let root = engine.tree().root();
        let windowing = root.tumbling.map(|_| root.clone());
        JoinPipeline {
            engine,
            sources: Vec::new(),
            processor,
            sink,
            config,
            should_stop: Arc::new(AtomicBool::new(false)),
            windowing,
            pending_window: None,
        }
    }

    /// Adding a source for one of the topology's streams (memory, file, MQTT, ...)
    pub fn add_source(&mut self, source: Box<dyn StreamSource>) -> Result<()> {
        let stream = source.stream_name();
        if self.engine.tree().node_id(stream).is_none() {
            return Err(Error::Config(format!("stream {} is not part of the topology", stream)));
        }
        if self.sources.iter().any(|s| s.stream_name() == stream) {
            return Err(Error::Config(format!("stream {} already has a source", stream)));
        }
        self.sources.push(source);
        Ok(())
    }

    /// Flag that cancels the run when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_stop)
    }

    pub fn engine(&self) -> &JoinEngine {
        &self.engine
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn run(&mut self) -> Result<PipelineReport> {
        for stream in self.engine.tree().stream_names() {
            if !self.sources.iter().any(|s| s.stream_name() == stream) {
                return Err(Error::Config(format!("no source for stream {}", stream)));
            }
        }

        info!(
            "Starting join pipeline over {} source(s), output stream {}",
            self.sources.len(),
            self.config.output_stream
        );
        let start_time = Instant::now();
        let mut metrics = PipelineMetrics::default();
        let mut active = vec![true; self.sources.len()];
        let mut idle_polls = 0u64;
        let per_turn = self.config.records_per_turn.max(1);

        let outcome = 'run: loop {
            if self.should_stop.load(Ordering::Relaxed) {
                info!("Stop signal received, shutting down pipeline");
                break PipelineOutcome::Cancelled;
            }
            if self.engine.state() == EngineState::Terminated {
                break PipelineOutcome::Terminated;
            }

            let mut progressed = false;
            for i in 0..self.sources.len() {
                for _ in 0..per_turn {
                    if !active[i] {
                        break;
                    }
                    let Some(item) = self.sources[i].poll_next()? else {
                        break;
                    };
                    progressed = true;

                    match &item {
                        StreamItem::EndOfStream => {
                            active[i] = false;
                            metrics.end_of_streams += 1;
                        }
                        StreamItem::Record(_) => metrics.records_read += 1,
                    }

                    if self.feed(i, item, &mut metrics)? {
                        break 'run PipelineOutcome::Stopped;
                    }
                }
            }

            if progressed {
                idle_polls = 0;
            } else {
                idle_polls += 1;
                if self.config.max_idle_polls.is_some_and(|max| idle_polls >= max) {
                    info!("No input for {} poll(s), ending run", idle_polls);
                    break PipelineOutcome::Idle;
                }
                thread::sleep(Duration::from_millis(self.config.idle_backoff_ms));
            }
        };

        if outcome != PipelineOutcome::Stopped {
            self.close_window(&mut metrics)?;
        }
        if matches!(outcome, PipelineOutcome::Terminated | PipelineOutcome::Stopped) {
            self.sink.end_of_stream(&self.config.output_stream)?;
        }
        self.sink.flush()?;

        let unmatched = if self.engine.state() == EngineState::Terminated {
            self.engine.drain()?
        } else {
            UnmatchedRecords::new()
        };
        for (stream, records) in &unmatched {
            if !records.is_empty() {
                warn!("{} record(s) of {} never joined", records.len(), stream);
            }
        }

        metrics.elapsed_seconds = start_time.elapsed().as_secs_f64();
        info!(
            "Pipeline {:?}: {} records read, {} tuples joined ({:.1}/s), {} records emitted in {:.3}s",
            outcome,
            metrics.records_read,
            metrics.tuples_joined,
            metrics.tuples_per_second(),
            metrics.records_emitted,
            metrics.elapsed_seconds
        );

        Ok(PipelineReport { outcome, metrics, engine: self.engine.metrics(), unmatched })
    }

    /// Ingest one item of source `index`. Returns whether the processor
    /// asked to stop.
    fn feed(
        &mut self,
        index: usize,
        item: StreamItem,
        metrics: &mut PipelineMetrics,
    ) -> Result<bool> {
        let stream = self.sources[index].stream_name().to_string();
        let output_stream = &self.config.output_stream;
        let processor = &mut self.processor;
        let sink = &mut self.sink;
        let windowing = self.windowing.as_ref();
        let pending = &mut self.pending_window;
        let mut stopped = false;

        self.engine.ingest(&stream, item, |tuple| {
            if stopped {
                return Ok(());
            }
            metrics.tuples_joined += 1;

            let Some(root) = windowing else {
                let output = processor.process(&tuple)?;
                stopped = emit_output(output, sink, output_stream, metrics)?;
                return Ok(());
            };

            let Some(key) = tuple.get(root.name()).and_then(|record| root.window_key(record)) else {
                debug!("No window for {}; skipping", tuple);
                metrics.tuples_skipped += 1;
                return Ok(());
            };
            if let Some(open) = pending.as_mut().filter(|batch| batch.key == key) {
                open.tuples.push(tuple);
                return Ok(());
            }
            // A tuple of another window closes the open one.
            if let Some(closed) = pending.replace(WindowBatch::open(root, key, tuple)) {
                metrics.windows_processed += 1;
                let output = processor.process_window(&closed)?;
                stopped = emit_output(output, sink, output_stream, metrics)?;
            }
            Ok(())
        })?;

        Ok(stopped)
    }

    /// Hand the open tumbling window, if any, to the processor.
    fn close_window(&mut self, metrics: &mut PipelineMetrics) -> Result<()> {
        let Some(batch) = self.pending_window.take() else {
            return Ok(());
        };
        debug!("Closing window {} with {} tuple(s)", batch.key, batch.tuples.len());
        metrics.windows_processed += 1;
        let output = self.processor.process_window(&batch)?;
        emit_output(output, &mut self.sink, &self.config.output_stream, metrics)?;
        Ok(())
    }
}

/// Write a processor's output to the sink. Returns whether it asked to stop.
fn emit_output<S: Sink>(
    output: ProcessOutput,
    sink: &mut S,
    output_stream: &str,
    metrics: &mut PipelineMetrics,
) -> Result<bool> {
    match output {
        ProcessOutput::Skip => metrics.tuples_skipped += 1,
        ProcessOutput::Record(record) => {
            sink.emit(output_stream, record)?;
            metrics.records_emitted += 1;
        }
        ProcessOutput::Records(records) => {
            for record in records {
                sink.emit(output_stream, record)?;
                metrics.records_emitted += 1;
            }
        }
        ProcessOutput::Stop => {
            debug!("Processor requested stop");
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Scalar, ScalarType, StreamType};
    use crate::expression::Expr;
    use crate::sinks::CollectingSink;
    use crate::sources::MemorySource;
    use crate::topology::TopologyBuilder;

    #[test]
    fn test_flatten_tuple_names_fields_by_stream() {
        let a = StreamType::new("A").field("k", ScalarType::Int);
        let b = StreamType::new("B").field("k", ScalarType::Int);
        let tree =
            TopologyBuilder::new(a).join(b, Expr::field("k"), Expr::field("k")).build().unwrap();
        let mut engine = JoinEngine::new(tree, EngineConfig::default());
        engine.ingest_collect("A", StreamRecord::new("A").with("k", 3).into()).unwrap();
        let tuples = engine.ingest_collect("B", StreamRecord::new("B").with("k", 3).into()).unwrap();

        let flat = flatten_tuple(&tuples[0], "out");
        assert_eq!(flat.stream, "out");
        assert_eq!(flat.get("A.k"), Some(&Scalar::Int(3)));
        assert_eq!(flat.get("B.k"), Some(&Scalar::Int(3)));
    }

    #[test]
    fn test_run_requires_a_source_per_stream() {
        let tree = JoinTree::single(StreamType::new("A").field("k", ScalarType::Int)).unwrap();
        let mut pipeline = JoinPipeline::new(
            tree,
            FlattenProcessor::new("out"),
            CollectingSink::new(),
            PipelineConfig::default(),
        );
        assert!(matches!(pipeline.run(), Err(Error::Config(_))));

        assert!(pipeline.add_source(Box::new(MemorySource::new("Z", Vec::new()))).is_err());
        pipeline.add_source(Box::new(MemorySource::new("A", Vec::new()).closing())).unwrap();
        assert!(pipeline.add_source(Box::new(MemorySource::new("A", Vec::new()))).is_err());

        let report = pipeline.run().unwrap();
        assert_eq!(report.outcome, PipelineOutcome::Terminated);
        assert!(pipeline.sink().is_closed("out"));
    }

    #[test]
    fn test_config_defaults_fill_missing_keys() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"output_stream": "x", "engine": {"clock": "arrival"}}"#)
                .unwrap();
        assert_eq!(config.output_stream, "x");
        assert_eq!(config.records_per_turn, 1);
        assert_eq!(config.engine.clock, crate::stream::ClockMode::Arrival);
        assert_eq!(config.engine.default_max_entries, crate::stream::DEFAULT_MAX_ENTRIES);
    }
}

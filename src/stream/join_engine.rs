//! The join engine: ingests records from every stream of a [`JoinTree`],
//! probes the buffers of correlated streams and emits joined tuples.
//!
//! The engine is single-threaded and synchronous. Each call to
//! [`JoinEngine::ingest`] either closes a stream or handles one record:
//!
//! 1. the record's correlation keys are evaluated, once per index of its node;
//! 2. every complete combination containing the record is enumerated by a
//!    depth-first walk of the tree starting at the record's node, probing the
//!    other nodes' buffers;
//! 3. the record is buffered so later arrivals on other streams can find it;
//! 4. each combination is handed to the caller's callback, in order.
//!
//! A combination is emitted exactly once: when its last record arrives.

use crate::core::{Scalar, StreamItem, StreamRecord};
use crate::error::Result;
use crate::expression::{evaluate, CorrelationKey};
use crate::stream::window_buffer::{BufferStats, BufferedEntry, EntryId, WindowBuffer};
use crate::topology::{IndexId, JoinTree, NodeId, TraversalStep};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Entry capacity applied to nodes without a retention window.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No stream has ended yet.
    Running,
    /// Some, but not all, streams have ended.
    Draining,
    /// Every stream has ended; buffers are flushed.
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Running => write!(f, "RUNNING"),
            EngineState::Draining => write!(f, "DRAINING"),
            EngineState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Source of "now" for buffer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Highest ordering-field value ingested so far.
    #[default]
    EventTime,
    /// Number of records ingested so far.
    Arrival,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of buffers whose node declares neither a window nor a
    /// capacity. Zero disables the safety valve.
    pub default_max_entries: usize,
    pub clock: ClockMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { default_max_entries: DEFAULT_MAX_ENTRIES, clock: ClockMode::EventTime }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Stream {0} is not part of the join topology")]
    UnknownStream(String),

    #[error("Stream {0} already signaled end of stream")]
    StreamClosed(String),

    #[error("Record of stream {found} was ingested on stream {expected}")]
    StreamMismatch { expected: String, found: String },

    #[error("Engine is terminated")]
    Terminated,

    #[error("Engine is not terminated yet (state: {0})")]
    NotTerminated(EngineState),
}

/// Raised when the capacity safety valve evicts records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOverflowWarning {
    pub stream: String,
    pub evicted: usize,
    /// Evicted records that never joined.
    pub unmatched: usize,
    pub capacity: usize,
}

pub type OverflowListener = Box<dyn FnMut(&BufferOverflowWarning) + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetrics {
    pub records_ingested: u64,
    pub tuples_emitted: u64,
    pub evaluation_errors: u64,
    pub expired: u64,
    pub expired_unmatched: u64,
    pub evicted: u64,
    pub evicted_unmatched: u64,
    pub end_of_streams: u64,
}

/// One complete combination: a record for every node, root first, then the
/// nodes in pair declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedTuple {
    records: Vec<(String, Arc<StreamRecord>)>,
    trigger: String,
}

impl JoinedTuple {
    pub fn get(&self, stream: &str) -> Option<&StreamRecord> {
        self.records.iter().find(|(name, _)| name == stream).map(|(_, r)| r.as_ref())
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &StreamRecord)> {
        self.records.iter().map(|(name, record)| (name.as_str(), record.as_ref()))
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stream whose record completed this tuple.
    pub fn trigger(&self) -> &str {
        &self.trigger
    }
}

impl fmt::Display for JoinedTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (_, record)) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, " ⋈ ")?;
            }
            write!(f, "{}", record)?;
        }
        write!(f, "]")
    }
}

/// Never-matched records per stream, in insertion order.
pub type UnmatchedRecords = BTreeMap<String, Vec<StreamRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    New,
    Buffered(EntryId),
}

pub struct JoinEngine {
    tree: JoinTree,
    config: EngineConfig,
    buffers: Vec<WindowBuffer>,
    plans: Vec<Vec<TraversalStep>>,
    indexes: Vec<Vec<IndexId>>,
    closed: Vec<bool>,
    flushed: Vec<bool>,
    /// Unmatched records kept for [`JoinEngine::drain`] once their buffer
    /// is flushed, bounded by `orphan_capacity`.
    orphans: Vec<VecDeque<Arc<StreamRecord>>>,
    orphan_capacity: Vec<Option<usize>>,
    state: EngineState,
    now: Option<i64>,
    next_sequence: u64,
    next_entry_id: EntryId,
    metrics: EngineMetrics,
    overflow_listener: Option<OverflowListener>,
}

impl JoinEngine {
    pub fn new(tree: JoinTree, config: EngineConfig) -> Self {
        let node_count = tree.nodes().len();
        let mut buffers = Vec::with_capacity(node_count);
        let mut plans = Vec::with_capacity(node_count);
        let mut indexes = Vec::with_capacity(node_count);
        let mut orphan_capacity = Vec::with_capacity(node_count);

        for (id, node) in tree.nodes().iter().enumerate() {
            let default_capacity = Some(config.default_max_entries).filter(|n| *n > 0);
            let capacity = node.max_entries.or(if node.window.is_none() {
                default_capacity
            } else {
                None
            });
            buffers.push(WindowBuffer::new(node.name(), node.window, capacity));
            plans.push(tree.traversal_from(id));
            indexes.push(tree.indexes_for(id));
            // No clock expires flushed records, so windowed nodes fall back
            // to the default capacity here.
            orphan_capacity.push(node.max_entries.or(default_capacity));
        }

        info!(
            "Join engine created for streams [{}] with {} pair(s)",
            tree.stream_names().collect::<Vec<_>>().join(", "),
            tree.pairs().len()
        );

        JoinEngine {
            config,
            buffers,
            plans,
            indexes,
            closed: vec![false; node_count],
            flushed: vec![false; node_count],
            orphans: vec![VecDeque::new(); node_count],
            orphan_capacity,
            state: EngineState::Running,
            now: None,
            next_sequence: 0,
            next_entry_id: 0,
            metrics: EngineMetrics::default(),
            overflow_listener: None,
            tree,
        }
    }

    /// Register a listener for capacity evictions.
    pub fn with_overflow_listener(mut self, listener: OverflowListener) -> Self {
        self.overflow_listener = Some(listener);
        self
    }

    pub fn tree(&self) -> &JoinTree {
        &self.tree
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics
    }

    /// Current engine time, once the clock has started.
    pub fn now(&self) -> Option<i64> {
        self.now
    }

    pub fn is_closed(&self, stream: &str) -> bool {
        self.tree.node_id(stream).is_some_and(|id| self.closed[id])
    }

    /// Records currently buffered for `stream`, oldest first.
    pub fn buffered(&self, stream: &str) -> Option<Vec<&StreamRecord>> {
        let id = self.tree.node_id(stream)?;
        Some(self.buffers[id].iter().map(|entry| entry.record.as_ref()).collect())
    }

    /// Lifetime counters of the buffer of `stream`.
    pub fn buffer_stats(&self, stream: &str) -> Option<BufferStats> {
        self.tree.node_id(stream).map(|id| self.buffers[id].stats())
    }

    /// Feed one item of `stream` into the engine. Every joined tuple the item
    /// completes is passed to `on_tuple` before this returns; an error from
    /// the callback stops delivery and is returned as is.
    ///
    /// Returns the number of tuples delivered.
    pub fn ingest<F>(&mut self, stream: &str, item: StreamItem, mut on_tuple: F) -> Result<usize>
    where
        F: FnMut(JoinedTuple) -> Result<()>,
    {
        if self.state == EngineState::Terminated {
            return Err(EngineError::Terminated.into());
        }
        let node =
            self.tree.node_id(stream).ok_or_else(|| EngineError::UnknownStream(stream.to_string()))?;
        if self.closed[node] {
            return Err(EngineError::StreamClosed(stream.to_string()).into());
        }

        match item {
            StreamItem::EndOfStream => {
                self.close_stream(node);
                Ok(0)
            }
            StreamItem::Record(record) => {
                if record.stream != stream {
                    return Err(EngineError::StreamMismatch {
                        expected: stream.to_string(),
                        found: record.stream,
                    }
                    .into());
                }
                let tuples = self.join_record(node, record);
                let mut delivered = 0;
                for tuple in tuples {
                    on_tuple(tuple)?;
                    delivered += 1;
                    self.metrics.tuples_emitted += 1;
                }
                Ok(delivered)
            }
        }
    }

    /// Ingest and collect the produced tuples.
    pub fn ingest_collect(&mut self, stream: &str, item: StreamItem) -> Result<Vec<JoinedTuple>> {
        let mut tuples = Vec::new();
        self.ingest(stream, item, |tuple| {
            tuples.push(tuple);
            Ok(())
        })?;
        Ok(tuples)
    }

    /// Move the clock forward without a record, expiring what falls out of
    /// the windows. The clock never moves backwards.
    pub fn advance_to(&mut self, now: i64) {
        self.advance_clock(now);
        self.sweep();
    }

    /// Take the never-matched records. Only available once terminated; a
    /// second call returns empty lists.
    pub fn drain(&mut self) -> Result<UnmatchedRecords> {
        if self.state != EngineState::Terminated {
            return Err(EngineError::NotTerminated(self.state).into());
        }

        let mut unmatched = UnmatchedRecords::new();
        for (id, node) in self.tree.nodes().iter().enumerate() {
            let records = std::mem::take(&mut self.orphans[id])
                .into_iter()
                .map(Arc::unwrap_or_clone)
                .collect();
            unmatched.insert(node.name().to_string(), records);
        }
        Ok(unmatched)
    }

    fn join_record(&mut self, node: NodeId, mut record: StreamRecord) -> Vec<JoinedTuple> {
        self.next_sequence += 1;
        record.sequence = self.next_sequence;
        if record.timestamp.is_none() {
            if let Some(order_field) = &self.tree.node(node).stream_type.order_field {
                record.timestamp = record.get(order_field).and_then(Scalar::as_i64);
            }
        }
        self.metrics.records_ingested += 1;

        let tick = match self.config.clock {
            ClockMode::EventTime => record.timestamp,
            ClockMode::Arrival => i64::try_from(self.next_sequence).ok(),
        };
        if let Some(tick) = tick {
            self.advance_clock(tick);
        }
        self.sweep();

        let keys = self.correlation_keys(node, &record);
        let record = Arc::new(record);
        let combinations = self.enumerate(node, &keys);

        for combination in &combinations {
            for (other, slot) in combination.iter().enumerate() {
                if let Slot::Buffered(id) = slot {
                    if let Some(entry) = self.buffers[other].get_mut(*id) {
                        entry.emitted += 1;
                    }
                }
            }
        }

        let tuples: Vec<JoinedTuple> = combinations
            .iter()
            .map(|combination| self.build_tuple(node, &record, combination))
            .collect();

        let mut entry = BufferedEntry::new(
            self.next_entry_id,
            Arc::clone(&record),
            keys,
            self.now.unwrap_or(i64::MIN),
        );
        self.next_entry_id += 1;
        entry.emitted = tuples.len() as u64;
        self.store(node, entry);

        tuples
    }

    /// Evaluate the record under every index of its node. Failures skip that
    /// index only.
    fn correlation_keys(
        &mut self,
        node: NodeId,
        record: &StreamRecord,
    ) -> Vec<(IndexId, CorrelationKey)> {
        let mut keys = Vec::with_capacity(self.indexes[node].len());
        for index in &self.indexes[node] {
            let expression = self.tree.pairs()[index.pair].expression(index.side);
            match evaluate(expression, record) {
                Ok(value) => match CorrelationKey::from_scalar(&value) {
                    Some(key) => keys.push((*index, key)),
                    None => debug!("{} evaluated to NaN for {}; not indexed", expression, record),
                },
                Err(e) => {
                    self.metrics.evaluation_errors += 1;
                    debug!("Skipping pair {} for {}: {}", index.pair, record, e);
                }
            }
        }
        keys
    }

    fn enumerate(&self, pivot: NodeId, keys: &[(IndexId, CorrelationKey)]) -> Vec<Vec<Slot>> {
        let mut assignment = vec![Slot::Empty; self.buffers.len()];
        assignment[pivot] = Slot::New;
        let mut combinations = Vec::new();
        self.extend(&self.plans[pivot], 0, keys, &mut assignment, &mut combinations);
        combinations
    }

    fn extend(
        &self,
        steps: &[TraversalStep],
        position: usize,
        new_keys: &[(IndexId, CorrelationKey)],
        assignment: &mut [Slot],
        combinations: &mut Vec<Vec<Slot>>,
    ) {
        let Some(step) = steps.get(position) else {
            combinations.push(assignment.to_vec());
            return;
        };

        let key = match assignment[step.from] {
            Slot::New => new_keys.iter().find(|(id, _)| *id == step.key_index).map(|(_, k)| k),
            Slot::Buffered(id) => {
                self.buffers[step.from].get(id).and_then(|entry| entry.key(step.key_index))
            }
            Slot::Empty => None,
        };
        let Some(key) = key else {
            return;
        };

        for candidate in self.buffers[step.to].lookup(step.probe_index, key) {
            assignment[step.to] = Slot::Buffered(candidate.id);
            self.extend(steps, position + 1, new_keys, assignment, combinations);
        }
        assignment[step.to] = Slot::Empty;
    }

    fn build_tuple(
        &self,
        pivot: NodeId,
        record: &Arc<StreamRecord>,
        combination: &[Slot],
    ) -> JoinedTuple {
        let records = combination
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let chosen = match slot {
                    Slot::New => Some(Arc::clone(record)),
                    Slot::Buffered(entry_id) => {
                        self.buffers[id].get(*entry_id).map(|e| Arc::clone(&e.record))
                    }
                    Slot::Empty => None,
                }?;
                Some((self.tree.node(id).name().to_string(), chosen))
            })
            .collect();

        JoinedTuple { records, trigger: self.tree.node(pivot).name().to_string() }
    }

    fn store(&mut self, node: NodeId, entry: BufferedEntry) {
        // Nothing probes this buffer, or nothing that could probe it is
        // still open: keep the record only for the unmatched report.
        if self.indexes[node].is_empty() || self.flushed[node] {
            if !entry.is_matched() {
                self.keep_orphans(node, std::iter::once(entry.record));
            }
            return;
        }

        let evicted = self.buffers[node].insert(entry);
        if evicted.is_empty() {
            return;
        }

        let unmatched = evicted.iter().filter(|e| !e.is_matched()).count();
        let capacity = self.buffers[node].capacity().unwrap_or_default();
        self.report_overflow(node, evicted.len(), unmatched, capacity);
    }

    /// Append unmatched records to the drain list of `node`, dropping the
    /// oldest beyond its capacity.
    fn keep_orphans(&mut self, node: NodeId, records: impl IntoIterator<Item = Arc<StreamRecord>>) {
        let orphans = &mut self.orphans[node];
        orphans.extend(records);

        let Some(capacity) = self.orphan_capacity[node] else {
            return;
        };
        let excess = orphans.len().saturating_sub(capacity);
        if excess > 0 {
            orphans.drain(..excess);
            self.report_overflow(node, excess, excess, capacity);
        }
    }

    fn report_overflow(&mut self, node: NodeId, evicted: usize, unmatched: usize, capacity: usize) {
        self.metrics.evicted += evicted as u64;
        self.metrics.evicted_unmatched += unmatched as u64;

        let warning = BufferOverflowWarning {
            stream: self.tree.node(node).name().to_string(),
            evicted,
            unmatched,
            capacity,
        };
        warn!(
            "Buffer of stream {} reached its capacity of {}; evicted {} record(s), {} never joined",
            warning.stream, warning.capacity, warning.evicted, warning.unmatched
        );
        if let Some(listener) = self.overflow_listener.as_mut() {
            listener(&warning);
        }
    }

    fn advance_clock(&mut self, tick: i64) {
        match self.now {
            Some(now) if tick <= now => {}
            Some(_) => self.now = Some(tick),
            None => {
                // Entries buffered before the clock started count as
                // inserted when it starts.
                for buffer in &mut self.buffers {
                    buffer.restamp(tick);
                }
                self.now = Some(tick);
            }
        }
    }

    fn sweep(&mut self) {
        let Some(now) = self.now else {
            return;
        };

        for buffer in &mut self.buffers {
            for entry in buffer.expire_due(now) {
                self.metrics.expired += 1;
                if !entry.is_matched() {
                    self.metrics.expired_unmatched += 1;
                    debug!(
                        "Expired unmatched {} (inserted at {}, now {})",
                        entry.record, entry.inserted_at, now
                    );
                }
            }
        }
    }

    fn close_stream(&mut self, node: NodeId) {
        self.closed[node] = true;
        self.metrics.end_of_streams += 1;
        info!("End of stream received for {}", self.tree.node(node).name());

        if self.closed.iter().all(|closed| *closed) {
            for id in 0..self.buffers.len() {
                self.flush(id);
            }
            self.state = EngineState::Terminated;
            info!("Join engine {}", self.state);
            return;
        }

        if self.state == EngineState::Running {
            self.state = EngineState::Draining;
            info!("Join engine {}", self.state);
        }

        // A buffer is dead once every other stream has ended: nothing can
        // arrive that would probe it.
        for id in 0..self.buffers.len() {
            let others_closed =
                self.closed.iter().enumerate().all(|(other, closed)| other == id || *closed);
            if others_closed {
                self.flush(id);
            }
        }
    }

    fn flush(&mut self, node: NodeId) {
        if self.flushed[node] {
            return;
        }
        self.flushed[node] = true;

        let entries = self.buffers[node].take_all();
        debug!("Flushing {} buffered record(s) of {}", entries.len(), self.tree.node(node).name());
        let unmatched = entries.into_iter().filter(|e| !e.is_matched()).map(|e| e.record);
        self.keep_orphans(node, unmatched);
    }
}

//! Incremental multi-stream join over buffered windows.

pub mod join_engine;
pub mod window_buffer;

pub use join_engine::{
    BufferOverflowWarning, ClockMode, EngineConfig, EngineError, EngineMetrics, EngineState,
    JoinEngine, JoinedTuple, OverflowListener, UnmatchedRecords, DEFAULT_MAX_ENTRIES,
};
pub use window_buffer::{BufferStats, BufferedEntry, EntryId, WindowBuffer};

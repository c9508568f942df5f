//! # Confluence
//!
//! Confluence joins several ordered record streams into one stream of
//! combined tuples, in a single process and without a query planner.
//!
//! Streams are arranged in a join tree: a root stream plus streams correlated
//! to it (or to each other) by equality of per-record expressions. Records may
//! arrive in any interleaving across streams; buffers bounded by retention
//! windows keep the ones that may still join.
//!
//! ## Example
//!
//! ```rust
//! use confluence::core::{ScalarType, StreamRecord, StreamType};
//! use confluence::expression::Expr;
//! use confluence::stream::{EngineConfig, JoinEngine};
//! use confluence::topology::TopologyBuilder;
//!
//! fn example() -> confluence::Result<()> {
//!     let location = StreamType::new("Location").field("time", ScalarType::Int);
//!     let speed = StreamType::new("Speed").field("time_from", ScalarType::Int);
//!     let tree = TopologyBuilder::new(location)
//!         .join(speed, Expr::field("time"), Expr::field("time_from"))
//!         .build()?;
//!
//!     let mut engine = JoinEngine::new(tree, EngineConfig::default());
//!     engine.ingest_collect("Speed", StreamRecord::new("Speed").with("time_from", 0).into())?;
//!     let tuples =
//!         engine.ingest_collect("Location", StreamRecord::new("Location").with("time", 0).into())?;
//!     assert_eq!(tuples.len(), 1);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::float_cmp)]

/// Core data structures and types
pub mod core;

/// Expressions over the fields of a single record
pub mod expression;

/// Join trees and their validation
pub mod topology;

/// Window buffers and the join engine
pub mod stream;

/// Parsing of topology declarations
pub mod parsing;

/// Record sources feeding the engine
pub mod sources;

/// Destinations for processed output
pub mod sinks;

/// The driving loop tying sources, engine and sink together
pub mod pipeline;

pub mod error {
    //! Error types and result definitions

    use crate::core::DecodeError;
    use crate::expression::EvaluationError;
    use crate::parsing::ParseError;
    use crate::stream::EngineError;
    use crate::topology::TopologyError;
    use thiserror::Error;

    /// Result type alias for Confluence operations
    pub type Result<T> = std::result::Result<T, Error>;

    /// Main error type for Confluence
    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Topology error: {0}")]
        Topology(#[from] TopologyError),

        #[error("Engine error: {0}")]
        Engine(#[from] EngineError),

        #[error("Evaluation error: {0}")]
        Evaluation(#[from] EvaluationError),

        #[error("Decode error: {0}")]
        Decode(#[from] DecodeError),

        #[error("Parse error: {0}")]
        Parse(#[from] ParseError),

        #[error("Source error: {0}")]
        Source(String),

        #[error("Sink error: {0}")]
        Sink(String),

        #[error("Processor error: {0}")]
        Processor(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Serialization error: {0}")]
        Serialization(#[from] serde_json::Error),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }
}

// Re-export commonly used types
pub use error::{Error, Result};
pub use pipeline::{JoinPipeline, PipelineConfig, PipelineOutcome, PipelineReport, ProcessOutput};
pub use stream::{EngineConfig, JoinEngine, JoinedTuple};
pub use topology::{JoinTree, TopologyBuilder};

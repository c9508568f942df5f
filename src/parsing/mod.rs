//! Parsers for the textual topology declaration and its join expressions.

pub mod expression_parser;
pub mod topology_parser;

pub use expression_parser::{parse_expression, ExpressionParser};
pub use topology_parser::{parse_topology, TopologyParser};

use crate::topology::TopologyError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Line {line}: unknown stream {stream}")]
    UnknownStream { line: usize, stream: String },

    #[error("Line {line}: {source}")]
    Topology {
        line: usize,
        #[source]
        source: TopologyError,
    },

    #[error("Invalid expression '{input}': {message}")]
    Expression { input: String, message: String },

    #[error("No ROOT stream declared")]
    MissingRoot,

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

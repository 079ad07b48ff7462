//! Step output handling.
//!
//! - [`LogMultiplexer`]: numbers lines, persists them and feeds the live sink
//! - [`LineSplitter`]: reassembles lines from arbitrarily chunked payloads

mod multiplexer;
mod splitter;

pub use multiplexer::{LogMultiplexer, LogSummary};
pub use splitter::LineSplitter;

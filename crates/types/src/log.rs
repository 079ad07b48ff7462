//! Log records produced while a step runs.

use serde::{Deserialize, Serialize};

/// Source stream of a log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogKind {
    Out,
    Err,
    Tty,
}

/// One tagged log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogItem {
    pub step_id: String,
    /// Strictly increasing per step across OUT and ERR.
    pub line_number: u64,
    pub kind: LogKind,
    pub content: Vec<u8>,
}

impl LogItem {
    /// Content as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

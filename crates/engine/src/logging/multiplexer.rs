//! Per-step log multiplexer.

use std::path::{Path, PathBuf};

use flowci_types::{LogItem, LogKind, VariableStore};
use flowci_util::{parse_unix_env, strip_ansi};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Outcome of closing a multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub path: PathBuf,
    /// Number of numbered lines written.
    pub log_size: u64,
}

/// Numbers the lines of one step and fans them out to the log file, the
/// optional raw mirror and the bounded live sink.
///
/// A single counter covers OUT and ERR. When the OUT stream emits the
/// attempt's sentinel line, every following OUT line is captured as a
/// `NAME=VALUE` pair instead of being written.
#[derive(Debug)]
pub struct LogMultiplexer {
    step_id: String,
    path: PathBuf,
    state: Mutex<MuxState>,
}

#[derive(Debug)]
struct MuxState {
    file: Option<BufWriter<File>>,
    raw: Option<BufWriter<File>>,
    sink: Option<mpsc::Sender<LogItem>>,
    line_count: u64,
    sentinel: Option<Vec<u8>>,
    capturing: bool,
    captured: VariableStore,
}

impl LogMultiplexer {
    /// Creates `<logging_dir>/<step_id>.log` (and `.raw.log` when `raw` is set).
    pub async fn open(
        step_id: impl Into<String>,
        logging_dir: &Path,
        raw: bool,
        sink: Option<mpsc::Sender<LogItem>>,
    ) -> std::io::Result<Self> {
        let step_id = step_id.into();
        tokio::fs::create_dir_all(logging_dir).await?;
        let path = logging_dir.join(format!("{step_id}.log"));
        let file = BufWriter::new(File::create(&path).await?);
        let raw = if raw {
            let raw_path = logging_dir.join(format!("{step_id}.raw.log"));
            Some(BufWriter::new(File::create(raw_path).await?))
        } else {
            None
        };
        debug!(step_id = %step_id, path = %path.display(), "opened step log");
        Ok(Self {
            step_id,
            path,
            state: Mutex::new(MuxState {
                file: Some(file),
                raw,
                sink,
                line_count: 0,
                sentinel: None,
                capturing: false,
                captured: VariableStore::new(),
            }),
        })
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a new attempt: installs its sentinel and drops anything captured before.
    pub async fn begin_attempt(&self, sentinel: Option<&str>) {
        let mut state = self.state.lock().await;
        state.sentinel = sentinel.map(|value| value.as_bytes().to_vec());
        state.capturing = false;
        state.captured = VariableStore::new();
    }

    /// Writes one line; trailing CR/LF are ignored.
    ///
    /// The sentinel may close a line the script left unterminated; whatever
    /// precedes it is written as ordinary output.
    pub async fn write_line(&self, kind: LogKind, line: &[u8]) -> std::io::Result<()> {
        let mut line = trim_line_end(line);
        let mut state = self.state.lock().await;

        if kind == LogKind::Out {
            if state.capturing {
                let text = String::from_utf8_lossy(line);
                let pairs = parse_unix_env(&text);
                state.captured.merge(&pairs);
                return Ok(());
            }
            if let Some(sentinel) = state.sentinel.as_deref()
                && line.ends_with(sentinel)
            {
                line = &line[..line.len() - sentinel.len()];
                state.capturing = true;
                if line.is_empty() {
                    return Ok(());
                }
            }
        }

        Self::append(&self.step_id, &mut state, kind, line).await
    }

    async fn append(step_id: &str, state: &mut MuxState, kind: LogKind, line: &[u8]) -> std::io::Result<()> {
        if state.file.is_none() {
            return Ok(());
        }
        state.line_count += 1;
        let line_number = state.line_count;

        if let Some(raw) = state.raw.as_mut() {
            raw.write_all(line).await?;
            raw.write_all(b"\n").await?;
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(&strip_ansi(line)).await?;
            file.write_all(b"\n").await?;
        }

        if let Some(sink) = state.sink.as_ref() {
            let item = LogItem {
                step_id: step_id.to_string(),
                line_number,
                kind,
                content: line.to_vec(),
            };
            if sink.send(item).await.is_err() {
                warn!(step_id = %step_id, "log sink closed; continuing with file only");
                state.sink = None;
            }
        }
        Ok(())
    }

    /// Writes each line of `text`.
    pub async fn write_text(&self, kind: LogKind, text: &str) -> std::io::Result<()> {
        for line in text.lines() {
            self.write_line(kind, line.as_bytes()).await?;
        }
        Ok(())
    }

    /// Number of numbered lines written so far.
    pub async fn line_count(&self) -> u64 {
        self.state.lock().await.line_count
    }

    /// Takes the variables captured after the sentinel.
    pub async fn take_captured(&self) -> VariableStore {
        std::mem::take(&mut self.state.lock().await.captured)
    }

    /// Flushes the files and releases the sink; later writes are dropped.
    pub async fn close(&self) -> std::io::Result<LogSummary> {
        let mut state = self.state.lock().await;
        if let Some(mut raw) = state.raw.take() {
            raw.flush().await?;
        }
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.into_inner().sync_all().await?;
        }
        state.sink = None;
        debug!(step_id = %self.step_id, log_size = state.line_count, "closed step log");
        Ok(LogSummary {
            path: self.path.clone(),
            log_size: state.line_count,
        })
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

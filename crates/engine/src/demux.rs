//! Decoder for the multiplexed Docker attach stream.
//!
//! Each frame is `[kind:1][0:3][length:4 big-endian][payload:length]` with
//! `kind` 1 for stdout and 2 for stderr. A stream that does not start with a
//! recognized header (a TTY exec, for example) is passed through verbatim.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

const HEADER_LEN: usize = 8;
const READ_CHUNK: usize = 8 * 1024;

/// Stream a demultiplexed record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Bytes that were not framed.
    Raw,
}

impl StreamKind {
    fn from_header(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxRecord {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

impl DemuxRecord {
    fn new(kind: StreamKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct StreamDemuxer {
    buffer: Vec<u8>,
    passthrough: bool,
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` and returns every record it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<DemuxRecord> {
        if self.passthrough {
            return if data.is_empty() {
                Vec::new()
            } else {
                vec![DemuxRecord::new(StreamKind::Raw, data.to_vec())]
            };
        }

        self.buffer.extend_from_slice(data);
        let mut records = Vec::new();
        loop {
            let Some(&first) = self.buffer.first() else { break };
            let Some(kind) = StreamKind::from_header(first) else {
                self.enter_passthrough(&mut records);
                break;
            };
            let padding_len = self.buffer.len().min(4) - 1;
            if self.buffer[1..1 + padding_len].iter().any(|byte| *byte != 0) {
                self.enter_passthrough(&mut records);
                break;
            }
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let length = u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]) as usize;
            if self.buffer.len() < HEADER_LEN + length {
                break;
            }
            let payload = self.buffer[HEADER_LEN..HEADER_LEN + length].to_vec();
            self.buffer.drain(..HEADER_LEN + length);
            records.push(DemuxRecord::new(kind, payload));
        }
        records
    }

    /// Returns buffered bytes that never formed a complete frame.
    pub fn finish(&mut self) -> Option<DemuxRecord> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(DemuxRecord::new(StreamKind::Raw, std::mem::take(&mut self.buffer)))
    }

    fn enter_passthrough(&mut self, records: &mut Vec<DemuxRecord>) {
        self.passthrough = true;
        records.push(DemuxRecord::new(StreamKind::Raw, std::mem::take(&mut self.buffer)));
    }
}

/// Async adapter yielding records from a reader.
pub struct DemuxReader<R> {
    reader: R,
    demuxer: StreamDemuxer,
    pending: VecDeque<DemuxRecord>,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> DemuxReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            demuxer: StreamDemuxer::new(),
            pending: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
            eof: false,
        }
    }

    /// Next record, or `None` at end of stream.
    pub async fn next(&mut self) -> std::io::Result<Option<DemuxRecord>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            if self.eof {
                return Ok(None);
            }
            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                self.eof = true;
                self.pending.extend(self.demuxer.finish());
                continue;
            }
            self.pending.extend(self.demuxer.push(&self.chunk[..read]));
        }
    }
}

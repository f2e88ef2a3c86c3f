use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// One NDJSON line as emitted by the log endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LogFrame {
    Streaming {
        #[serde(default)]
        log: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Consumer-facing event. `End` is synthesized by the stream reader at clean
/// end-of-stream; the decoder itself only produces `Line` and `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Line(String),
    Error { message: String },
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogDecodeError {
    #[error("log line exceeds max size: {size} > {max}")]
    OversizedLine { size: usize, max: usize },
    #[error("log buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
}

#[derive(Debug, Clone, Default)]
pub struct DecodeBatch {
    pub events: Vec<LogEvent>,
    pub errors: Vec<LogDecodeError>,
}

/// Incremental NDJSON line decoder. Raw bytes go in chunk by chunk; complete
/// lines come out as `LogEvent`s. A trailing partial line is held back until
/// the next chunk or `finish` so a line split across chunks is never parsed
/// prematurely. A line that is not valid frame JSON is passed through as
/// plain text rather than dropped.
pub struct LogLineDecoder {
    max_line_bytes: usize,
    pending: Vec<u8>,
}

impl LogLineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            pending: Vec::new(),
        }
    }
}

impl Default for LogLineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LogLineDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeBatch {
        let mut batch = DecodeBatch::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if line.ends_with(b"\n") {
                line.pop();
            }
            if line.ends_with(b"\r") {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            self.decode_line(&line, &mut batch);
        }

        if !self.pending.is_empty() && self.pending.len() > self.max_line_bytes {
            batch.errors.push(LogDecodeError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_line_bytes,
            });
            self.pending.clear();
        }

        batch
    }

    pub fn finish(&mut self) -> DecodeBatch {
        if self.pending.is_empty() {
            return DecodeBatch::default();
        }

        let mut final_line = std::mem::take(&mut self.pending);
        if final_line.ends_with(b"\r") {
            final_line.pop();
        }
        let mut batch = DecodeBatch::default();
        self.decode_line(&final_line, &mut batch);
        batch
    }

    fn decode_line(&self, line: &[u8], batch: &mut DecodeBatch) {
        if line.len() > self.max_line_bytes {
            batch.errors.push(LogDecodeError::OversizedLine {
                size: line.len(),
                max: self.max_line_bytes,
            });
            return;
        }
        match serde_json::from_slice::<LogFrame>(line) {
            Ok(LogFrame::Streaming { log }) => batch.events.push(LogEvent::Line(log)),
            Ok(LogFrame::Error { message }) => batch.events.push(LogEvent::Error { message }),
            Err(_) => {
                let text = String::from_utf8_lossy(line).into_owned();
                batch.events.push(LogEvent::Line(text));
            }
        }
    }
}

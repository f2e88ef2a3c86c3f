use fleetdeck_api::{ApiError, LogChunkSource, RunnerTransport};
use fleetdeck_core::log_wire::{LogEvent, LogLineDecoder};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Connecting,
    Streaming,
    Errored,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Closed => "closed",
            StreamState::Connecting => "connecting",
            StreamState::Streaming => "streaming",
            StreamState::Errored => "errored",
        }
    }
}

/// Pull-based reader over one runner's log stream. The caller drains events
/// with `next_event`; the reader owns the connection state:
///
/// `Closed -> Connecting -> Streaming -> Closed | Errored`
///
/// Streaming begins on the first received chunk, not on connect. A clean EOF
/// yields a final [`LogEvent::End`]; closing the reader locally never does,
/// and is never an error.
pub struct LogStreamReader<S: LogChunkSource> {
    state: StreamState,
    source: Option<S>,
    decoder: LogLineDecoder,
    queued: VecDeque<LogEvent>,
    last_error: Option<ApiError>,
}

impl<S: LogChunkSource> LogStreamReader<S> {
    pub fn new() -> Self {
        Self {
            state: StreamState::Closed,
            source: None,
            decoder: LogLineDecoder::default(),
            queued: VecDeque::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Transport-level failure that ended the stream, if any. Survives a
    /// `close` so callers can still report why the last attempt died.
    pub fn last_error(&self) -> Option<&ApiError> {
        self.last_error.as_ref()
    }

    pub async fn open<T>(&mut self, transport: &T, id: u64)
    where
        T: RunnerTransport<LogStream = S>,
    {
        self.reset();
        self.state = StreamState::Connecting;
        debug!(event = "log_stream_connecting", runner_id = id);
        match transport.open_log_stream(id).await {
            Ok(source) => {
                self.source = Some(source);
            }
            Err(err) => {
                warn!(event = "log_stream_open_failed", runner_id = id, error = %err);
                self.queued.push_back(LogEvent::Error {
                    message: err.to_string(),
                });
                self.last_error = Some(err);
                self.state = StreamState::Errored;
            }
        }
    }

    /// Next event from the stream, reading more chunks as needed. Returns
    /// `None` once the stream is fully drained (closed or errored with the
    /// queue empty).
    pub async fn next_event(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            let source = self.source.as_mut()?;
            match source.next_chunk().await {
                Ok(Some(chunk)) => {
                    if self.state == StreamState::Connecting {
                        self.state = StreamState::Streaming;
                        debug!(event = "log_stream_streaming");
                    }
                    let batch = self.decoder.push_chunk(&chunk);
                    for err in &batch.errors {
                        warn!(event = "log_decode_error", error = %err);
                    }
                    self.enqueue(batch.events);
                }
                Ok(None) => {
                    let batch = self.decoder.finish();
                    for err in &batch.errors {
                        warn!(event = "log_decode_error", error = %err);
                    }
                    self.enqueue(batch.events);
                    if self.state != StreamState::Errored {
                        self.queued.push_back(LogEvent::End);
                        self.state = StreamState::Closed;
                        debug!(event = "log_stream_ended");
                    }
                    self.source = None;
                }
                Err(err) => {
                    warn!(event = "log_stream_failed", error = %err);
                    self.queued.push_back(LogEvent::Error {
                        message: err.to_string(),
                    });
                    self.last_error = Some(err);
                    self.state = StreamState::Errored;
                    self.source = None;
                }
            }
        }
    }

    /// Local cancellation. Drops the connection and any queued events
    /// without emitting `End` and without entering `Errored`.
    pub fn close(&mut self) {
        self.source = None;
        self.queued.clear();
        self.decoder = LogLineDecoder::default();
        self.state = StreamState::Closed;
        debug!(event = "log_stream_closed");
    }

    fn reset(&mut self) {
        self.close();
        self.last_error = None;
    }

    /// A server-sent error frame terminates the stream: the error event is
    /// queued, anything decoded after it is dropped, and no further chunks
    /// are read.
    fn enqueue(&mut self, events: Vec<LogEvent>) {
        for event in events {
            let fatal = matches!(event, LogEvent::Error { .. });
            self.queued.push_back(event);
            if fatal {
                self.state = StreamState::Errored;
                self.source = None;
                break;
            }
        }
    }
}

impl<S: LogChunkSource> Default for LogStreamReader<S> {
    fn default() -> Self {
        Self::new()
    }
}

use crate::cancel::CancelToken;
use crate::listeners::LineListener;
use tether_core::{OutputLine, StreamSource, TetherError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// What a drain saw before it stopped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Full decoded text, line terminators included. `None` unless capture was requested.
    pub captured: Option<String>,
    pub lines: usize,
    /// `false` when the drain stopped early on cancellation or a read error.
    pub reached_eof: bool,
}

/// Reads one child stream to the end, line by line.
///
/// One drainer runs per stream, each on its own task, so a full pipe on one
/// stream can never stall reads on the other.
pub struct StreamDrainer {
    source: StreamSource,
    listeners: Vec<LineListener>,
    capture: bool,
    cancel: CancelToken,
}

impl StreamDrainer {
    pub fn new(source: StreamSource, cancel: CancelToken) -> Self {
        Self {
            source,
            listeners: Vec::new(),
            capture: false,
            cancel,
        }
    }

    pub fn with_listeners(mut self, listeners: &[LineListener]) -> Self {
        self.listeners.extend_from_slice(listeners);
        self
    }

    /// Accumulate the full text for the owner.
    pub fn capturing(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn spawn<R>(self, reader: R) -> JoinHandle<DrainOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.drain(reader))
    }

    pub async fn drain<R>(self, reader: R) -> DrainOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut outcome = DrainOutcome {
            captured: self.capture.then(String::new),
            ..Default::default()
        };

        loop {
            if self.cancel.is_cancelled() {
                debug!(stream = %self.source, lines = outcome.lines, "Drain interrupted");
                return outcome;
            }

            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read,
                _ = self.cancel.cancelled() => {
                    debug!(stream = %self.source, lines = outcome.lines, "Drain interrupted");
                    return outcome;
                }
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    // Splitting on '\n' never cuts a UTF-8 sequence in half.
                    let chunk = String::from_utf8_lossy(&buf);
                    if let Some(captured) = outcome.captured.as_mut() {
                        captured.push_str(&chunk);
                    }

                    let line = OutputLine::new(strip_terminator(&chunk), self.source);
                    trace!(stream = %self.source, line = %line.text, "Output line");
                    for listener in &self.listeners {
                        listener(&line);
                    }
                    outcome.lines += 1;
                }
                Err(e) => {
                    let err = TetherError::StreamReadFailure {
                        stream: self.source,
                        source: e,
                    };
                    warn!(error = %err, lines = outcome.lines, "Stream drain ended early");
                    return outcome;
                }
            }
        }

        outcome.reached_eof = true;
        outcome
    }
}

fn strip_terminator(chunk: &str) -> &str {
    let line = chunk.strip_suffix('\n').unwrap_or(chunk);
    line.strip_suffix('\r').unwrap_or(line)
}

use tokio::{
    io::{AsyncRead, BufReader},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    framing::{BoundedLineReader, Frame, DEFAULT_MAX_LINE_BYTES},
    sanitize,
};

pub const STDERR_TRUNCATION_MARKER: &str = "[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StderrLimits {
    pub max_lines: usize,
    pub max_line_chars: usize,
}

impl Default for StderrLimits {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            max_line_chars: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StderrBuffer {
    lines: Vec<String>,
    truncated: bool,
}

impl StderrBuffer {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }

    pub fn mentions_error(&self) -> bool {
        self.lines
            .iter()
            .any(|line| line.to_ascii_lowercase().contains("error"))
    }

    fn push(&mut self, line: String, limits: StderrLimits) {
        if self.lines.len() < limits.max_lines {
            let (mut kept, cut) = sanitize::excerpt(&line, limits.max_line_chars);
            if cut {
                kept.push_str("...");
            }
            self.lines.push(kept);
        } else if !self.truncated {
            self.truncated = true;
            self.lines.push(STDERR_TRUNCATION_MARKER.to_string());
        }
    }
}

/// Read errors and `released` end collection quietly with whatever was gathered.
pub(crate) async fn collect_stderr<R>(
    reader: R,
    limits: StderrLimits,
    released: &CancellationToken,
) -> StderrBuffer
where
    R: AsyncRead + Unpin,
{
    let mut lines = BoundedLineReader::new(BufReader::new(reader), DEFAULT_MAX_LINE_BYTES);
    let mut buffer = StderrBuffer::default();
    loop {
        let frame = tokio::select! {
            biased;
            () = released.cancelled() => break,
            frame = lines.next_frame() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        match frame {
            Ok(Frame::Line { bytes, .. }) => {
                let text = String::from_utf8_lossy(&bytes);
                buffer.push(text.trim_end_matches('\r').to_string(), limits);
            }
            Ok(Frame::TooLong { observed_bytes, .. }) => {
                buffer.push(format!("[stderr line too long: {observed_bytes} bytes]"), limits);
            }
            Err(err) => {
                debug!(error = %err, "stopped reading claude stderr");
                break;
            }
        }
    }
    buffer
}

pub(crate) fn spawn_stderr_collector<R>(
    reader: R,
    limits: StderrLimits,
    released: CancellationToken,
) -> oneshot::Receiver<StderrBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let buffer = collect_stderr(reader, limits, &released).await;
        let _ = done_tx.send(buffer);
    });
    done_rx
}

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Default upper bound for a single stdout line (10 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Line {
        line_number: usize,
        bytes: Vec<u8>,
    },
    /// Emitted as soon as the limit is crossed; the rest of that line is skipped by later reads.
    TooLong {
        line_number: usize,
        observed_bytes: usize,
    },
}

enum Step {
    Take { consumed: usize, complete: bool },
    Overflow { consumed: usize, complete: bool },
    Skip { consumed: usize, complete: bool },
}

/// Newline framing over an async byte stream with a hard per-line limit.
///
/// Bytes past the limit are never buffered, so a runaway line costs at most
/// `max_line_bytes` of memory.
pub(crate) struct BoundedLineReader<R> {
    reader: R,
    max_line_bytes: usize,
    current_line: Vec<u8>,
    observed_bytes: usize,
    skipping: bool,
    line_number: usize,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> BoundedLineReader<R> {
    pub(crate) fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            current_line: Vec::new(),
            observed_bytes: 0,
            skipping: false,
            line_number: 0,
            done: false,
        }
    }

    /// Returns the next frame, `None` at end of stream, or the read error that ended it.
    ///
    /// Cancel safe: a partially read line stays buffered across calls.
    pub(crate) async fn next_frame(&mut self) -> Option<io::Result<Frame>> {
        if self.done {
            return None;
        }

        loop {
            let step = {
                let available = match self.reader.fill_buf().await {
                    Ok(available) => available,
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                };

                if available.is_empty() {
                    None
                } else {
                    let newline = available.iter().position(|b| *b == b'\n');
                    let (segment, consumed) = match newline {
                        Some(idx) => (&available[..idx], idx + 1),
                        None => (available, available.len()),
                    };
                    let complete = newline.is_some();

                    if self.skipping {
                        Some(Step::Skip { consumed, complete })
                    } else {
                        self.observed_bytes = self.observed_bytes.saturating_add(segment.len());
                        if self.observed_bytes > self.max_line_bytes {
                            Some(Step::Overflow { consumed, complete })
                        } else {
                            self.current_line.extend_from_slice(segment);
                            Some(Step::Take { consumed, complete })
                        }
                    }
                }
            };

            match step {
                None => {
                    self.done = true;
                    if !self.skipping && !self.current_line.is_empty() {
                        return Some(Ok(self.finish_line()));
                    }
                    return None;
                }
                Some(Step::Take { consumed, complete }) => {
                    self.reader.consume(consumed);
                    if complete {
                        return Some(Ok(self.finish_line()));
                    }
                }
                Some(Step::Overflow { consumed, complete }) => {
                    self.reader.consume(consumed);
                    self.skipping = !complete;
                    return Some(Ok(self.overflow()));
                }
                Some(Step::Skip { consumed, complete }) => {
                    self.reader.consume(consumed);
                    if complete {
                        self.skipping = false;
                    }
                }
            }
        }
    }

    fn finish_line(&mut self) -> Frame {
        self.line_number += 1;
        self.observed_bytes = 0;
        Frame::Line {
            line_number: self.line_number,
            bytes: std::mem::take(&mut self.current_line),
        }
    }

    fn overflow(&mut self) -> Frame {
        self.line_number += 1;
        self.current_line = Vec::new();
        let observed_bytes = std::mem::take(&mut self.observed_bytes);
        Frame::TooLong {
            line_number: self.line_number,
            observed_bytes,
        }
    }
}

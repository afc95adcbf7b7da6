use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingComponent {
    /// The JavaScript runtime the CLI is distributed for is not installed.
    Runtime,
    Cli,
}

/// At most one of these is sent on the error channel of a receive cycle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{message}")]
    CliNotFound {
        message: String,
        cli_path: Option<PathBuf>,
        missing: MissingComponent,
    },
    #[error("claude connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error(transparent)]
    Process(#[from] ProcessFailure),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("internal failure: {0}")]
    Internal(String),
    #[error("request is invalid: {0}")]
    InvalidRequest(String),
    #[error("claude query timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl TransportError {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn connection_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn not_connected() -> Self {
        Self::connection("not connected")
    }

    pub fn is_cli_not_found(&self) -> bool {
        matches!(self, Self::CliNotFound { .. })
    }
}

/// Non-zero exit of the CLI, correlated with its (sanitized) stderr.
#[derive(Debug, Clone, Error)]
pub struct ProcessFailure {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("claude process failed")?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code: {code})")?;
        }
        if !self.stderr.is_empty() {
            write!(f, "\nerror output: {}", self.stderr)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Malformed,
    Oversized,
}

/// Only an excerpt of the offending line is kept (see [`DecodeError::MAX_EXCERPT_CHARS`]).
#[derive(Debug, Error)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub line_number: usize,
    pub excerpt: String,
    pub truncated: bool,
    pub observed_bytes: usize,
    #[source]
    pub source: Option<serde_json::Error>,
}

impl DecodeError {
    pub const MAX_EXCERPT_CHARS: usize = 200;

    pub(crate) fn malformed(line_number: usize, line: &str, source: serde_json::Error) -> Self {
        let (excerpt, truncated) = crate::sanitize::excerpt(line, Self::MAX_EXCERPT_CHARS);
        Self {
            kind: DecodeErrorKind::Malformed,
            line_number,
            excerpt,
            truncated,
            observed_bytes: line.len(),
            source: Some(source),
        }
    }

    pub(crate) fn oversized(line_number: usize, observed_bytes: usize) -> Self {
        Self {
            kind: DecodeErrorKind::Oversized,
            line_number,
            excerpt: String::from("[JSON too large]"),
            truncated: false,
            observed_bytes,
            source: None,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DecodeErrorKind::Oversized => write!(
                f,
                "stream-json line {} exceeds maximum size ({} bytes observed)",
                self.line_number, self.observed_bytes
            ),
            DecodeErrorKind::Malformed => {
                write!(
                    f,
                    "failed to decode stream-json line {}: {}",
                    self.line_number, self.excerpt
                )?;
                if self.truncated {
                    f.write_str("...")?;
                }
                if let Some(source) = self.source.as_ref() {
                    write!(f, ": {source}")?;
                }
                Ok(())
            }
        }
    }
}

#![forbid(unsafe_code)]
//! Subprocess transport for the Claude Code CLI (`claude`) in headless stream-json mode.
//!
//! The crate launches `claude --output-format stream-json --verbose ... --print <prompt>`,
//! frames its stdout into bounded lines, decodes each line into a generic JSON [`Record`] and
//! hands records to the caller over a [`Delivery`]: a record channel paired with an error
//! channel that carries at most one terminal [`TransportError`]. Mapping records onto typed
//! messages is left to the caller (see [`deserialize_record`]).
//!
//! ```no_run
//! use claude_code_transport::{query, QueryOptions, SubprocessTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), claude_code_transport::TransportError> {
//! let options = QueryOptions::new(SubprocessTransport::builder().args(["--model", "sonnet"]));
//! let mut delivery = query("Summarize README.md", options, CancellationToken::new());
//! while let Some(record) = delivery.next().await {
//!     println!("{:?}", record?.get("type"));
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod decode;
mod delivery;
mod discovery;
mod environment;
mod error;
mod framing;
mod process;
mod query;
mod request;
mod sanitize;
mod stderr;
mod transport;

pub use builder::TransportBuilder;
pub use decode::{decode_line, decode_lines, deserialize_record, LineOutcome, Record};
pub use delivery::{ChannelCapacities, Delivery, ErrorReceiver, RecordReceiver};
pub use discovery::{CliResolver, PathLookup};
pub use environment::{
    normalize_working_dir, EnvFilter, SafeEnvFilter, ENTRYPOINT_ENV, ENTRYPOINT_VALUE,
};
pub use error::{DecodeError, DecodeErrorKind, MissingComponent, ProcessFailure, TransportError};
pub use framing::DEFAULT_MAX_LINE_BYTES;
pub use process::{ExitOutcome, GRACE_PERIOD};
pub use query::{query, query_map, query_with_transport, QueryOptions};
pub use request::{ArgsBuilder, StaticArgs};
pub use sanitize::redact_error_text;
pub use stderr::{StderrBuffer, StderrLimits, STDERR_TRUNCATION_MARKER};
pub use transport::{NonZeroExitPolicy, SubprocessTransport, Transport};

use tokio::{
    io::{AsyncRead, BufReader},
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::NonZeroExitPolicy;
use crate::{
    decode::{decode_line, LineOutcome},
    delivery::{run_guarded, DeliveryProducer, SendOutcome},
    framing::{BoundedLineReader, Frame},
    process::{await_exit, ExitOutcome},
    redact_error_text,
    stderr::spawn_stderr_collector,
    DecodeError, ProcessFailure, Record, StderrBuffer, StderrLimits, TransportError,
};

/// Longest stderr excerpt carried by a [`ProcessFailure`].
const MAX_FAILURE_STDERR_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CycleSettings {
    pub(crate) max_line_bytes: usize,
    pub(crate) stderr_limits: StderrLimits,
    pub(crate) exit_policy: NonZeroExitPolicy,
}

/// Spawns the stdout pump for one receive cycle.
///
/// The cycle ends without an error once `released` fires, dropping both readers even if
/// another process still holds the write ends.
pub(crate) fn spawn_cycle<O, E>(
    stdout: O,
    stderr: E,
    exit: watch::Receiver<Option<ExitOutcome>>,
    released: CancellationToken,
    settings: CycleSettings,
    producer: DeliveryProducer<Record>,
) where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(run_guarded(producer, move |producer| {
        run_cycle(stdout, stderr, exit, released, settings, producer)
    }));
}

enum PumpEnd {
    Eof,
    Stopped,
}

async fn run_cycle<O, E>(
    stdout: O,
    stderr: E,
    mut exit: watch::Receiver<Option<ExitOutcome>>,
    released: CancellationToken,
    settings: CycleSettings,
    producer: DeliveryProducer<Record>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin + Send + 'static,
{
    let stderr_done = spawn_stderr_collector(stderr, settings.stderr_limits, released.clone());

    let pumped = pump_stdout(stdout, settings.max_line_bytes, &released, &producer).await;
    if let PumpEnd::Stopped = pumped {
        return;
    }

    // Exit classification only after stdout hit EOF, so a CLI blocked on a full pipe cannot
    // deadlock the wait.
    let cancel = producer.cancel_token().clone();
    let stderr = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = released.cancelled() => return,
        collected = stderr_done => collected.unwrap_or_default(),
    };
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = released.cancelled() => return,
        outcome = await_exit(&mut exit) => outcome,
    };

    if let Some(err) = classify_exit(outcome, &stderr, settings.exit_policy) {
        producer.send_error(err);
    }
}

async fn pump_stdout<O>(
    stdout: O,
    max_line_bytes: usize,
    released: &CancellationToken,
    producer: &DeliveryProducer<Record>,
) -> PumpEnd
where
    O: AsyncRead + Unpin,
{
    let cancel = producer.cancel_token();
    let mut frames = BoundedLineReader::new(BufReader::new(stdout), max_line_bytes);
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => return PumpEnd::Stopped,
            () = released.cancelled() => {
                debug!("claude pipes released; ending receive cycle");
                return PumpEnd::Stopped;
            }
            frame = frames.next_frame() => frame,
        };

        let (line_number, bytes) = match frame {
            None => return PumpEnd::Eof,
            Some(Err(err)) => {
                producer.send_error(TransportError::connection_io("error reading stdout", err));
                return PumpEnd::Stopped;
            }
            Some(Ok(Frame::TooLong {
                line_number,
                observed_bytes,
            })) => {
                debug!(line_number, observed_bytes, "stdout line exceeds limit");
                producer.send_error(DecodeError::oversized(line_number, observed_bytes).into());
                return PumpEnd::Stopped;
            }
            Some(Ok(Frame::Line { line_number, bytes })) => (line_number, bytes),
        };

        let outcome = decode_line(line_number, &String::from_utf8_lossy(&bytes));
        match outcome {
            LineOutcome::Skipped => {}
            LineOutcome::Failed(err) => {
                producer.send_error(err.into());
                return PumpEnd::Stopped;
            }
            LineOutcome::Record(record) => match producer.send_record(record).await {
                SendOutcome::Delivered => {}
                SendOutcome::Cancelled | SendOutcome::ReceiverDropped => return PumpEnd::Stopped,
            },
        }
    }
}

/// Turns an unsuccessful exit into a [`ProcessFailure`] when `policy` says it is reportable.
pub(crate) fn classify_exit(
    outcome: ExitOutcome,
    stderr: &StderrBuffer,
    policy: NonZeroExitPolicy,
) -> Option<TransportError> {
    if outcome.success {
        return None;
    }

    let reportable = match policy {
        NonZeroExitPolicy::RequireErrorText => stderr.mentions_error(),
        NonZeroExitPolicy::Always => true,
    };
    if !reportable {
        warn!(
            exit_code = ?outcome.code,
            stderr_lines = stderr.lines().len(),
            "claude exited unsuccessfully without error output; not reporting"
        );
        return None;
    }

    Some(
        ProcessFailure {
            exit_code: outcome.code,
            stderr: redact_error_text(&stderr.joined(), MAX_FAILURE_STDERR_CHARS),
        }
        .into(),
    )
}

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::watch,
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{MissingComponent, TransportError};

/// How long an interrupted CLI gets to exit before it is killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was killed by a signal or its status could not be read.
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitOutcome {
    fn from_wait(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                success: status.success(),
            },
            Err(err) => {
                warn!(error = %err, "failed waiting for claude process");
                Self::unknown()
            }
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) env: Vec<(OsString, OsString)>,
}

/// A started CLI process and the task that owns its [`Child`].
#[derive(Debug)]
pub(crate) struct ProcessSession {
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stop: CancellationToken,
    released: CancellationToken,
    exit: watch::Receiver<Option<ExitOutcome>>,
    supervisor: JoinHandle<()>,
}

impl ProcessSession {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn take_stdio(&mut self) -> Option<(ChildStdout, ChildStderr)> {
        match (self.stdout.take(), self.stderr.take()) {
            (Some(stdout), Some(stderr)) => Some((stdout, stderr)),
            (stdout, stderr) => {
                self.stdout = stdout;
                self.stderr = stderr;
                None
            }
        }
    }

    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit.clone()
    }

    /// Fires once the session lets go of its pipes. A receive cycle holding them must drop its
    /// readers then, since a grandchild of the CLI may keep the write ends open indefinitely.
    pub(crate) fn released(&self) -> CancellationToken {
        self.released.clone()
    }

    /// Interrupts the process, kills it after [`GRACE_PERIOD`], and releases the pipes.
    pub(crate) async fn stop(mut self) -> ExitOutcome {
        self.stop.cancel();
        if let Err(err) = (&mut self.supervisor).await {
            warn!(error = %err, "claude supervisor task failed");
        }
        self.stdout = None;
        self.stderr = None;
        self.released.cancel();
        let outcome = *self.exit.borrow();
        outcome.unwrap_or_else(ExitOutcome::unknown)
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        // An abandoned session still gets the interrupt-then-kill treatment.
        self.stop.cancel();
        self.released.cancel();
    }
}

/// Call only after stdout is drained so a CLI blocked on a full pipe cannot deadlock us.
pub(crate) async fn await_exit(exit: &mut watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    match exit.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).unwrap_or_else(ExitOutcome::unknown),
        Err(_) => ExitOutcome::unknown(),
    }
}

pub(crate) async fn spawn_with_retry(
    command: &mut Command,
    binary: &Path,
) -> std::io::Result<Child> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    debug!(binary = ?binary, attempt, "claude binary busy; retrying spawn");
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    attempt += 1;
                    continue;
                }
                return Err(source);
            }
        }
    }
}

pub(crate) fn apply_env(command: &mut Command, env: &[(OsString, OsString)]) {
    command.env_clear();
    for (k, v) in env {
        command.env(k, v);
    }
}

pub(crate) async fn start(spec: &LaunchSpec) -> Result<ProcessSession, TransportError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = spec.working_dir.as_ref() {
        command.current_dir(dir);
    }
    apply_env(&mut command, &spec.env);

    let mut child = spawn_with_retry(&mut command, &spec.program)
        .await
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                TransportError::CliNotFound {
                    message: format!("Claude Code not found at: {}", spec.program.display()),
                    cli_path: Some(spec.program.clone()),
                    missing: MissingComponent::Cli,
                }
            } else {
                TransportError::connection_io("failed to start Claude Code", source)
            }
        })?;

    // Dropping `child` on the error paths kills it and closes whichever pipe was opened.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::connection("failed to create stdout pipe"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::connection("failed to create stderr pipe"))?;

    let pid = child.id();
    let stop = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);
    let supervisor = tokio::spawn(supervise(child, stop.clone(), exit_tx));
    debug!(pid = ?pid, program = ?spec.program, "started claude process");

    Ok(ProcessSession {
        pid,
        stdout: Some(stdout),
        stderr: Some(stderr),
        stop,
        released: CancellationToken::new(),
        exit: exit_rx,
        supervisor,
    })
}

async fn supervise(
    mut child: Child,
    stop: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => ExitOutcome::from_wait(status),
        () = stop.cancelled() => terminate(&mut child, GRACE_PERIOD).await,
    };
    debug!(code = ?outcome.code, success = outcome.success, "claude process exited");
    exit_tx.send_replace(Some(outcome));
}

async fn terminate(child: &mut Child, grace: Duration) -> ExitOutcome {
    match interrupt(child) {
        Ok(()) => match time::timeout(grace, child.wait()).await {
            Ok(status) => return ExitOutcome::from_wait(status),
            Err(_) => warn!(grace = ?grace, "claude ignored interrupt; killing"),
        },
        Err(err) => debug!(error = %err, "could not interrupt claude; killing"),
    }

    if let Err(err) = child.kill().await {
        debug!(error = %err, "failed to kill claude process");
    }
    ExitOutcome::from_wait(child.wait().await)
}

#[cfg(unix)]
fn interrupt(child: &Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped; the following wait returns immediately.
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful interrupt is not supported on this platform",
    ))
}

//! Connection lifecycle around one `claude` subprocess.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    builder::TransportBuilder,
    delivery::{self, Delivery},
    discovery::resolve_cli_path,
    environment::{child_env, normalize_working_dir},
    process::{self, LaunchSpec, ProcessSession},
    request::stream_json_argv,
    TransportError,
};

mod receive;

use receive::CycleSettings;

/// What to do when the CLI exits non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NonZeroExitPolicy {
    /// Report a [`crate::ProcessFailure`] only when stderr mentions "error".
    #[default]
    RequireErrorText,
    /// Report every unsuccessful exit.
    Always,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Stops the CLI, gracefully first. Safe to call in any state and more than once.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Starts a receive cycle over the CLI output.
    ///
    /// When not connected the returned delivery already holds a "not connected" error.
    fn receive_messages(&self, cancel: CancellationToken) -> Delivery;

    fn is_connected(&self) -> bool;
}

/// [`Transport`] backed by a local `claude` process speaking stream-json.
#[derive(Debug)]
pub struct SubprocessTransport {
    pub(crate) prompt: String,
    pub(crate) config: TransportBuilder,
    session: Mutex<Option<ProcessSession>>,
    // Serializes connect and disconnect; `session` itself is only locked briefly.
    lifecycle: AsyncMutex<()>,
}

impl SubprocessTransport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::default()
    }

    pub(crate) fn from_builder(prompt: String, config: TransportBuilder) -> Self {
        Self {
            prompt,
            config,
            session: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_session().as_ref().and_then(ProcessSession::pid)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ProcessSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch_spec(&self) -> Result<LaunchSpec, TransportError> {
        let config = &self.config;
        let program = resolve_cli_path(config.binary.as_deref(), config.resolver.as_ref())?;
        let args = stream_json_argv(config.args.as_ref(), &self.prompt)?;
        let working_dir = match config.working_dir.as_deref() {
            Some(dir) => normalize_working_dir(dir)?,
            None => None,
        };
        let extra: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let env = child_env(std::env::vars_os(), config.env_filter.as_ref(), &extra);

        Ok(LaunchSpec {
            program,
            args,
            working_dir,
            env,
        })
    }

    fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            max_line_bytes: self.config.max_line_bytes,
            stderr_limits: self.config.stderr_limits,
            exit_policy: self.config.exit_policy,
        }
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let spec = self.launch_spec()?;
        let session = process::start(&spec).await?;
        *self.lock_session() = Some(session);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.lock_session().take();
        if let Some(session) = session {
            let pid = session.pid();
            let outcome = session.stop().await;
            debug!(pid = ?pid, code = ?outcome.code, "disconnected from claude");
        }
        Ok(())
    }

    fn receive_messages(&self, cancel: CancellationToken) -> Delivery {
        let capacities = self.config.capacities;
        let (stdio, exit, released) = {
            let mut session = self.lock_session();
            let Some(session) = session.as_mut() else {
                return Delivery::failed(TransportError::not_connected(), capacities);
            };
            (
                session.take_stdio(),
                session.exit_watch(),
                session.released(),
            )
        };
        let Some((stdout, stderr)) = stdio else {
            return Delivery::failed(
                TransportError::connection("output is already being received"),
                capacities,
            );
        };

        let (producer, delivery) = delivery::channel(capacities, cancel);
        receive::spawn_cycle(
            stdout,
            stderr,
            exit,
            released,
            self.cycle_settings(),
            producer,
        );
        delivery
    }

    fn is_connected(&self) -> bool {
        self.lock_session().is_some()
    }
}

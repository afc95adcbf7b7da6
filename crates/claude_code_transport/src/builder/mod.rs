use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use crate::{
    discovery::{CliResolver, PathLookup},
    environment::{EnvFilter, SafeEnvFilter},
    request::{ArgsBuilder, StaticArgs},
    transport::{NonZeroExitPolicy, SubprocessTransport},
    ChannelCapacities, StderrLimits, DEFAULT_MAX_LINE_BYTES,
};

/// Configures a [`SubprocessTransport`].
#[derive(Clone)]
pub struct TransportBuilder {
    pub(crate) binary: Option<PathBuf>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) args: Arc<dyn ArgsBuilder>,
    pub(crate) resolver: Arc<dyn CliResolver>,
    pub(crate) env_filter: Arc<dyn EnvFilter>,
    pub(crate) capacities: ChannelCapacities,
    pub(crate) max_line_bytes: usize,
    pub(crate) stderr_limits: StderrLimits,
    pub(crate) exit_policy: NonZeroExitPolicy,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            binary: None,
            working_dir: None,
            env: BTreeMap::new(),
            args: Arc::new(StaticArgs::default()),
            resolver: Arc::new(PathLookup::default()),
            env_filter: Arc::new(SafeEnvFilter::default()),
            capacities: ChannelCapacities::default(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            stderr_limits: StderrLimits::default(),
            exit_policy: NonZeroExitPolicy::default(),
        }
    }
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("binary", &self.binary)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("capacities", &self.capacities)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("stderr_limits", &self.stderr_limits)
            .field("exit_policy", &self.exit_policy)
            .finish_non_exhaustive()
    }
}

impl TransportBuilder {
    /// Explicit CLI path; skips `CLAUDE_BINARY` and the resolver.
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Extra variable for the child, applied after the env filter.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Arc::new(StaticArgs(args.into_iter().map(Into::into).collect()));
        self
    }

    pub fn args_builder(mut self, args: impl ArgsBuilder + 'static) -> Self {
        self.args = Arc::new(args);
        self
    }

    pub fn resolver(mut self, resolver: impl CliResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn env_filter(mut self, filter: impl EnvFilter + 'static) -> Self {
        self.env_filter = Arc::new(filter);
        self
    }

    pub fn capacities(mut self, capacities: ChannelCapacities) -> Self {
        self.capacities = capacities;
        self
    }

    pub fn max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn stderr_limits(mut self, limits: StderrLimits) -> Self {
        self.stderr_limits = limits;
        self
    }

    pub fn exit_policy(mut self, policy: NonZeroExitPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    pub fn build(mut self, prompt: impl Into<String>) -> SubprocessTransport {
        // Avoid any updater side effects by default; callers may override explicitly.
        self.env
            .entry("DISABLE_AUTOUPDATER".to_string())
            .or_insert_with(|| "1".to_string());

        SubprocessTransport::from_builder(prompt.into(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_defaults_disable_autoupdater_unless_overridden() {
        let transport = TransportBuilder::default().build("hi");
        assert_eq!(
            transport.config.env.get("DISABLE_AUTOUPDATER").map(String::as_str),
            Some("1")
        );

        let transport = TransportBuilder::default()
            .env("DISABLE_AUTOUPDATER", "0")
            .build("hi");
        assert_eq!(
            transport.config.env.get("DISABLE_AUTOUPDATER").map(String::as_str),
            Some("0")
        );
    }

    #[test]
    fn debug_output_hides_env_values() {
        let builder = TransportBuilder::default().env("CLAUDE_TOKEN", "sekrit");
        let rendered = format!("{builder:?}");
        assert!(rendered.contains("CLAUDE_TOKEN"));
        assert!(!rendered.contains("sekrit"));
    }
}

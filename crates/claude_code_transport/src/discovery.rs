use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{MissingComponent, TransportError};

pub trait CliResolver: Send + Sync {
    fn resolve_cli(&self) -> Option<PathBuf>;

    /// Whether the runtime the CLI is distributed for is installed.
    ///
    /// Only consulted after [`CliResolver::resolve_cli`] fails, to pick the failure message.
    fn runtime_available(&self) -> bool {
        true
    }
}

/// Searches `PATH` for `claude`, and for `node` to explain a missing CLI.
#[derive(Debug, Clone)]
pub struct PathLookup {
    cli_name: String,
    runtime_name: String,
    search_path: Option<OsString>,
}

impl PathLookup {
    pub fn new(cli_name: impl Into<String>, runtime_name: impl Into<String>) -> Self {
        Self {
            cli_name: cli_name.into(),
            runtime_name: runtime_name.into(),
            search_path: None,
        }
    }

    pub fn search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        let path = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

impl Default for PathLookup {
    fn default() -> Self {
        Self::new("claude", "node")
    }
}

impl CliResolver for PathLookup {
    fn resolve_cli(&self) -> Option<PathBuf> {
        self.find(&self.cli_name)
    }

    fn runtime_available(&self) -> bool {
        self.find(&self.runtime_name).is_some()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Resolution order: explicit path, then `CLAUDE_BINARY`, then `resolver`.
pub(crate) fn resolve_cli_path(
    explicit: Option<&Path>,
    resolver: &dyn CliResolver,
) -> Result<PathBuf, TransportError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(v) = std::env::var("CLAUDE_BINARY") {
        if !v.trim().is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let Some(path) = resolver.resolve_cli() {
        return Ok(path);
    }

    Err(if resolver.runtime_available() {
        TransportError::CliNotFound {
            message: "Claude Code not found. Install with:\n  \
                      npm install -g @anthropic-ai/claude-code"
                .to_string(),
            cli_path: None,
            missing: MissingComponent::Cli,
        }
    } else {
        TransportError::CliNotFound {
            message: "Claude Code requires Node.js, which is not installed.\n\
                      Install Node.js from: https://nodejs.org/"
                .to_string(),
            cli_path: None,
            missing: MissingComponent::Runtime,
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tempfile::TempDir;

    use super::*;

    fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn path_lookup_requires_executable_bit() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "claude", 0o644);
        let lookup = PathLookup::default().search_path(dir.path());
        assert_eq!(lookup.resolve_cli(), None);

        let cli = touch(dir.path(), "claude", 0o755);
        assert_eq!(lookup.resolve_cli(), Some(cli));
    }

    #[test]
    fn missing_runtime_is_distinguished_from_missing_cli() {
        let dir = TempDir::new().unwrap();
        let lookup = PathLookup::default().search_path(dir.path());
        let err = resolve_cli_path(None, &lookup).unwrap_err();
        assert!(matches!(
            err,
            TransportError::CliNotFound {
                missing: MissingComponent::Runtime,
                ..
            }
        ));

        touch(dir.path(), "node", 0o755);
        let err = resolve_cli_path(None, &lookup).unwrap_err();
        assert!(matches!(
            err,
            TransportError::CliNotFound {
                missing: MissingComponent::Cli,
                ..
            }
        ));
        assert!(err.to_string().contains("npm install"));
    }

    #[test]
    fn explicit_path_wins() {
        let lookup = PathLookup::default().search_path("");
        let path = resolve_cli_path(Some(Path::new("/opt/claude")), &lookup).unwrap();
        assert_eq!(path, PathBuf::from("/opt/claude"));
    }
}

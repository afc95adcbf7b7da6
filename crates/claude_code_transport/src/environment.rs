use std::{
    collections::BTreeSet,
    ffi::OsString,
    path::{Component, Path, PathBuf},
};

use crate::TransportError;

pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";
pub const ENTRYPOINT_VALUE: &str = "sdk-rust";

/// Decides which inherited environment variables reach the CLI process.
pub trait EnvFilter: Send + Sync {
    fn allows(&self, key: &str) -> bool;
}

impl<F> EnvFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn allows(&self, key: &str) -> bool {
        self(key)
    }
}

#[derive(Debug, Clone)]
pub struct SafeEnvFilter {
    allowed_prefixes: Vec<String>,
    blocked: BTreeSet<String>,
}

impl SafeEnvFilter {
    pub const DEFAULT_ALLOWED_PREFIXES: &'static [&'static str] = &[
        "CLAUDE_", "LANG", "LC_", "TZ", "TERM", "USER", "HOME", "PATH", "TMPDIR", "TEMP", "TMP",
    ];
    pub const DEFAULT_BLOCKED: &'static [&'static str] = &[
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
        "GITHUB_TOKEN",
        "NPM_TOKEN",
        "ANTHROPIC_API_KEY",
    ];

    pub fn new<P, B>(allowed_prefixes: P, blocked: B) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            allowed_prefixes: allowed_prefixes.into_iter().map(Into::into).collect(),
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.allowed_prefixes.push(prefix.into());
        self
    }

    pub fn block(mut self, key: impl Into<String>) -> Self {
        self.blocked.insert(key.into());
        self
    }
}

impl Default for SafeEnvFilter {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_ALLOWED_PREFIXES.iter().copied(),
            Self::DEFAULT_BLOCKED.iter().copied(),
        )
    }
}

impl EnvFilter for SafeEnvFilter {
    fn allows(&self, key: &str) -> bool {
        if self.blocked.contains(key) {
            return false;
        }
        self.allowed_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

/// Builds the child environment: filtered inherited vars, then `extra`, then the entrypoint marker.
pub(crate) fn child_env<I>(
    inherited: I,
    filter: &dyn EnvFilter,
    extra: &[(String, String)],
) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = inherited
        .into_iter()
        .filter(|(key, _)| key.to_str().is_some_and(|key| filter.allows(key)))
        .collect();

    for (key, value) in extra {
        env.retain(|(existing, _)| existing.as_os_str() != key.as_str());
        env.push((key.into(), value.into()));
    }

    env.retain(|(existing, _)| existing.as_os_str() != ENTRYPOINT_ENV);
    env.push((ENTRYPOINT_ENV.into(), ENTRYPOINT_VALUE.into()));
    env
}

/// Cleans `dir` lexically and makes it absolute.
///
/// Empty input means "inherit the caller's directory" and yields `None`. Paths that still
/// climb above their starting point after cleaning are rejected.
pub fn normalize_working_dir(dir: &Path) -> Result<Option<PathBuf>, TransportError> {
    if dir.as_os_str().is_empty() {
        return Ok(None);
    }

    let mut cleaned = PathBuf::new();
    let mut depth = 0usize;
    for component in dir.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => cleaned.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    cleaned.pop();
                    depth -= 1;
                } else if !dir.is_absolute() {
                    return Err(TransportError::InvalidRequest(format!(
                        "working directory escapes its base: {}",
                        dir.display()
                    )));
                }
            }
            Component::Normal(part) => {
                cleaned.push(part);
                depth += 1;
            }
        }
    }

    if cleaned.is_absolute() {
        return Ok(Some(cleaned));
    }
    let cwd = std::env::current_dir().map_err(|err| {
        TransportError::InvalidRequest(format!("cannot resolve current directory: {err}"))
    })?;
    Ok(Some(cwd.join(cleaned)))
}

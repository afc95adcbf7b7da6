use crate::TransportError;

/// Produces the caller-specific CLI arguments (model, permissions, tools, ...).
pub trait ArgsBuilder: Send + Sync {
    fn build_args(&self) -> Result<Vec<String>, String>;
}

impl<F> ArgsBuilder for F
where
    F: Fn() -> Result<Vec<String>, String> + Send + Sync,
{
    fn build_args(&self) -> Result<Vec<String>, String> {
        self()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticArgs(pub Vec<String>);

impl ArgsBuilder for StaticArgs {
    fn build_args(&self) -> Result<Vec<String>, String> {
        Ok(self.0.clone())
    }
}

/// `--output-format stream-json --verbose <args> --print <prompt>`
pub(crate) fn stream_json_argv(
    args: &dyn ArgsBuilder,
    prompt: &str,
) -> Result<Vec<String>, TransportError> {
    let extra = args.build_args().map_err(TransportError::InvalidRequest)?;

    let mut argv = Vec::with_capacity(extra.len() + 5);
    argv.push("--output-format".to_string());
    argv.push("stream-json".to_string());
    argv.push("--verbose".to_string());
    argv.extend(extra);
    argv.push("--print".to_string());
    argv.push(prompt.to_string());
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_wraps_caller_args() {
        let args = StaticArgs(vec!["--model".into(), "sonnet".into()]);
        let argv = stream_json_argv(&args, "hello").unwrap();
        assert_eq!(
            argv,
            [
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                "sonnet",
                "--print",
                "hello"
            ]
        );
    }

    #[test]
    fn builder_failure_is_invalid_request() {
        let failing = || -> Result<Vec<String>, String> { Err("bad permission mode".into()) };
        let err = stream_json_argv(&failing, "hi").unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(msg) if msg == "bad permission mode"));
    }
}

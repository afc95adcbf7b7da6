#[cfg(unix)]
mod unix {
    use std::{fs, path::PathBuf, time::Duration};

    use claude_code_transport::{
        deserialize_record, query, query_map, QueryOptions, SubprocessTransport, TransportError,
    };
    use serde::Deserialize;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn fake_claude(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.path().join("fake-claude");
        fs::write(&script_path, format!("#!/bin/sh\nset -eu\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).expect("chmod");
        script_path
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Message {
        Assistant { text: String },
        Result { num_turns: u32, is_error: bool },
    }

    #[tokio::test]
    async fn typed_query_drops_unknown_records() {
        let dir = TempDir::new().expect("temp dir");
        let script = fake_claude(
            &dir,
            r#"echo '{"type":"system","subtype":"init","session_id":"s"}'
echo '{"type":"assistant","text":"hello"}'
echo '{"type":"result","num_turns":1,"is_error":false}'"#,
        );
        let options = QueryOptions::new(SubprocessTransport::builder().binary(&script));

        let messages = query_map(
            "say hello",
            options,
            CancellationToken::new(),
            deserialize_record::<Message>,
        )
        .collect()
        .await
        .expect("query succeeds");
        assert_eq!(
            messages,
            [
                Message::Assistant {
                    text: "hello".to_string()
                },
                Message::Result {
                    num_turns: 1,
                    is_error: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn query_timeout_delivers_records_then_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let script = fake_claude(
            &dir,
            r#"trap 'exit 0' INT
echo '{"type":"assistant","text":"thinking"}'
while true; do sleep 0.1; done"#,
        );
        let options = QueryOptions::new(SubprocessTransport::builder().binary(&script))
            .timeout(Some(Duration::from_millis(300)));
        let mut delivery = query("slow", options, CancellationToken::new());

        let first = delivery.next().await.expect("record").expect("ok record");
        assert_eq!(first["text"], "thinking");
        let err = delivery.next().await.expect("timeout").unwrap_err();
        assert!(matches!(
            err,
            TransportError::Timeout { timeout } if timeout == Duration::from_millis(300)
        ));
        assert!(delivery.next().await.is_none());
    }

    #[tokio::test]
    async fn query_surfaces_missing_cli() {
        let dir = TempDir::new().expect("temp dir");
        let options = QueryOptions::new(
            SubprocessTransport::builder().binary(dir.path().join("missing-claude")),
        );

        let err = query("hi", options, CancellationToken::new())
            .collect()
            .await
            .unwrap_err();
        assert!(err.is_cli_not_found());
    }
}

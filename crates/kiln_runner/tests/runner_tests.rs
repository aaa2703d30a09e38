//! Integration tests for the command execution layer.
//!
//! The process runner tests shell out to `sh`, so they only run on unix.

use kiln_runner::{CommandRunner, CommandSpec, MockResponse, MockRunner, RunnerError};

#[cfg(unix)]
mod process {
    use kiln_runner::{CommandRunner, CommandSpec, ProcessRunner, RunnerError};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_process_runner_captures_stdout() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo hello"]);

        let output = runner.run(&spec).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.finished_at >= output.started_at);
    }

    #[tokio::test]
    async fn test_process_runner_env_layering() {
        let runner = ProcessRunner::new()
            .with_env("KILN_GREETING", "runner")
            .with_env("KILN_TARGET", "world");
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"$KILN_GREETING $KILN_TARGET\""])
            .env("KILN_GREETING", "spec");

        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "spec world");
    }

    #[tokio::test]
    async fn test_process_runner_input_and_cwd() {
        let dir = tempdir().unwrap();
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sh")
            .cwd(dir.path())
            .input("touch piped.txt\n");

        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert!(dir.path().join("piped.txt").exists());
    }

    #[tokio::test]
    async fn test_process_runner_failure_is_checked() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 4"]);

        match runner.run(&spec).await {
            Err(RunnerError::CommandFailed { exit_code, output, .. }) => {
                assert_eq!(exit_code, 4);
                assert_eq!(output.trim(), "broken");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("kiln-definitely-not-installed").arg("--version");

        match runner.run(&spec).await {
            Err(RunnerError::Spawn { command, .. }) => {
                assert_eq!(command, "kiln-definitely-not-installed --version");
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }
}

/// Components receive runners as trait objects.
#[tokio::test]
async fn test_mock_runner_as_trait_object() {
    let mock = MockRunner::new().when(&["version"], MockResponse::success("restic 0.16.4"));
    let runner: std::sync::Arc<dyn CommandRunner> = std::sync::Arc::new(mock.clone());

    let output = runner
        .run(&CommandSpec::new("restic").arg("version"))
        .await
        .unwrap();

    assert_eq!(output.stdout, "restic 0.16.4");
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_mock_runner_failure_output_reaches_caller() {
    let mock = MockRunner::new().when(
        &["init"],
        MockResponse::failure(1, "Fatal: create key in repository failed"),
    );

    let err = mock
        .run(&CommandSpec::new("restic").arg("init"))
        .await
        .unwrap_err();

    match err {
        RunnerError::CommandFailed { command, output, .. } => {
            assert_eq!(command, "restic init");
            assert!(output.contains("create key"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

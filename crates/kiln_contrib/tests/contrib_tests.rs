//! Integration tests for the contrib components.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_contrib::{
    BackupProps, LocalSecret, ResticBackup, ResticProps, ResticRepository, SecretProps,
};
use kiln_core::{
    ComponentPath, Deploy, JsonFileBackend, KilnError, MemoryBackend, Orchestrator, StateStore,
    Stack, Upgradable,
};
use kiln_runner::{CommandRunner, MockResponse, MockRunner};
use serde_json::json;
use tempfile::TempDir;

fn path(p: &str) -> ComponentPath {
    ComponentPath::parse(p)
}

#[tokio::test]
async fn test_secret_is_generated_once() {
    let mut stack = Stack::new("test", StateStore::in_memory());
    let secret = stack
        .add("secret", |node| LocalSecret::new(node, SecretProps::default()))
        .unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    secret.on_change().add(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let before = secret.value().resolve().await.unwrap_err();
    assert!(before.is_not_available());

    let first = secret.deploy(false).await.unwrap().settle().await.unwrap();
    assert!(first.changed);

    let second = secret.deploy(false).await.unwrap().settle().await.unwrap();
    assert!(!second.changed);

    let value = secret.value().resolve().await.unwrap();
    assert!(!value.is_empty());
    assert_eq!(secret.value().resolve().await.unwrap(), value);
    assert_eq!(
        stack.store().get_value(&path("secret"), "value"),
        Some(json!(value))
    );
    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_secret_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let file = dir.path().join("state.json");

    let mut stack = Stack::new("test", StateStore::open(JsonFileBackend::new(&file))?);
    let secret = stack.add("secret", |node| {
        LocalSecret::new(node, SecretProps::with_length(16))
    })?;
    Orchestrator::new().apply(&stack.root(), true, false).await?;
    let value = secret.value().resolve().await?;
    assert_eq!(value.len(), 16);

    let mut stack = Stack::new("test", StateStore::open(JsonFileBackend::new(&file))?);
    let secret = stack.add("secret", |node| {
        LocalSecret::new(node, SecretProps::with_length(16))
    })?;
    let report = Orchestrator::new().apply(&stack.root(), true, false).await?;

    assert!(!report.has_drift());
    assert_eq!(secret.value().resolve().await?, value);
    Ok(())
}

#[tokio::test]
async fn test_repository_is_initialized_once() {
    let backend = MemoryBackend::with_contents(r#"{"repo": {"initialized": false}}"#);
    let store = StateStore::open(backend.clone()).unwrap();
    let runner = MockRunner::new();
    let shared: Arc<dyn CommandRunner> = Arc::new(runner.clone());

    let mut stack = Stack::new("test", store.clone());
    let repo = stack
        .add("repo", |node| {
            ResticRepository::new(node, ResticProps::new("/srv/restic", "pw"), shared)
        })
        .unwrap();

    let preview = repo.deploy(true).await.unwrap().settle().await.unwrap();
    assert!(preview.changed);
    assert_eq!(
        store.get_value(&path("repo"), "initialized"),
        Some(json!(false))
    );
    assert_eq!(runner.call_count(), 0);

    let outcome = repo.deploy(false).await.unwrap();
    assert!(outcome.is_deferred());
    assert_eq!(runner.call_count(), 0);

    let applied = outcome.settle().await.unwrap();
    assert!(applied.changed);
    assert!(runner.was_called("restic init --repository-version=1"));
    assert!(repo.initialized().unwrap());

    let again = repo.deploy(false).await.unwrap().settle().await.unwrap();
    assert!(!again.changed);
    assert_eq!(runner.call_count(), 1);
}

#[tokio::test]
async fn test_failed_init_aborts_with_output() {
    let runner = MockRunner::new().when(
        &["init"],
        MockResponse::failure(1, "Fatal: create repository at /srv/restic failed"),
    );
    let shared: Arc<dyn CommandRunner> = Arc::new(runner.clone());
    let store = StateStore::in_memory();

    let mut stack = Stack::new("test", store.clone());
    stack
        .add("repo", |node| {
            ResticRepository::new(node, ResticProps::new("/srv/restic", "pw"), shared)
        })
        .unwrap();

    let err = Orchestrator::new()
        .apply(&stack.root(), true, false)
        .await
        .unwrap_err();

    let KilnError::Abort(abort) = err else {
        panic!("expected abort");
    };
    let failure = abort.report.failure.as_ref().unwrap();
    assert_eq!(failure.path, path("repo"));
    assert!(failure
        .output
        .as_deref()
        .unwrap_or_default()
        .contains("create repository"));
    assert!(store.get_value(&path("repo"), "initialized").is_none());
}

#[tokio::test]
async fn test_backup_wires_secret_into_repository() {
    let backend = MemoryBackend::new();
    let runner = MockRunner::new();
    let shared: Arc<dyn CommandRunner> = Arc::new(runner.clone());

    let mut stack = Stack::new("media", StateStore::open(backend.clone()).unwrap());
    let backup = stack
        .add("backup", |node| {
            ResticBackup::new(node, BackupProps::new("b2:media-backup:"), shared)
        })
        .unwrap();

    let preview = Orchestrator::new()
        .apply(&stack.root(), false, false)
        .await
        .unwrap();
    assert_eq!(preview.changed_count(), 2);
    assert!(backend.contents().is_none());
    assert_eq!(runner.call_count(), 0);

    let report = backup.upgrade(&stack, false, true).await.unwrap();
    let paths: Vec<String> = report.entries.iter().map(|e| e.path.to_string()).collect();
    assert_eq!(paths, vec!["backup/password", "backup/repo"]);
    assert_eq!(report.changed_count(), 2);

    let password = backup
        .password()
        .unwrap()
        .value()
        .resolve()
        .await
        .unwrap();
    let init = &runner.get_calls()[0];
    assert_eq!(init.command_line(), "restic init --repository-version=1");
    assert_eq!(init.env["RESTIC_PASSWORD"], password);
    assert_eq!(init.env["RESTIC_REPOSITORY"], "b2:media-backup:");

    let rerun = backup.upgrade(&stack, false, true).await.unwrap();
    assert!(!rerun.has_drift());
    assert_eq!(runner.call_count(), 1);
    assert_eq!(backup.job_priority(), 1);
    assert_eq!(backup.job_priority(), 2);
}

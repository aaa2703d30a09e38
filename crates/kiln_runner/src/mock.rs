//! Mock command runner for testing.
//!
//! Provides a configurable mock implementation of the CommandRunner trait
//! for use in unit tests without invoking real tools.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::command::{CommandOutput, CommandSpec};
use crate::error::{RunnerError, RunnerResult};
use crate::runner::CommandRunner;

/// Predefined mock response for a command execution.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 100,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 100,
        }
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub input: Option<String>,
}

impl CapturedCall {
    /// Program and arguments joined with spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
struct MockRule {
    prefix: Vec<String>,
    response: MockResponse,
    once: bool,
}

impl MockRule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        spec.args.len() >= self.prefix.len()
            && spec.args.iter().zip(&self.prefix).all(|(arg, want)| arg == want)
    }
}

/// Mock command runner for testing.
///
/// Responses are picked in this order: the first matching one-shot rule, the
/// first matching persistent rule, then the response queue (cycling). With
/// nothing configured every command succeeds with empty output.
#[derive(Clone)]
pub struct MockRunner {
    /// Argument-prefix rules.
    rules: Arc<RwLock<Vec<MockRule>>>,
    /// Predefined responses for unmatched calls.
    responses: Arc<RwLock<Vec<MockResponse>>>,
    /// Index of next response to return.
    response_index: Arc<AtomicUsize>,
    /// Captured calls for verification.
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// Simulated failure to return (as a string message for ExecutionFailed).
    simulate_failure: Arc<RwLock<Option<String>>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self {
            rules: Arc::new(RwLock::new(Vec::new())),
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            simulate_failure: Arc::new(RwLock::new(None)),
        }
    }

    /// Answer every command whose arguments start with `prefix`.
    pub fn when(self, prefix: &[&str], response: MockResponse) -> Self {
        self.push_rule(prefix, response, false);
        self
    }

    /// Answer the next command whose arguments start with `prefix`, once.
    pub fn when_once(self, prefix: &[&str], response: MockResponse) -> Self {
        self.push_rule(prefix, response, true);
        self
    }

    /// Add a mock response for the next unmatched call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Set multiple responses.
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        *self.responses.write() = responses;
        self
    }

    /// Set a failure to simulate.
    pub fn simulate_failure(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// Check if a command line starting with `prefix` was run.
    pub fn was_called(&self, prefix: &str) -> bool {
        self.captured_calls
            .read()
            .iter()
            .any(|c| c.command_line().starts_with(prefix))
    }

    fn push_rule(&self, prefix: &[&str], response: MockResponse, once: bool) {
        self.rules.write().push(MockRule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            response,
            once,
        });
    }

    /// Record a call.
    fn record_call(&self, spec: &CommandSpec) {
        self.captured_calls.write().push(CapturedCall {
            program: spec.program.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            input: spec.input.clone(),
        });
    }

    fn matching_rule(&self, spec: &CommandSpec) -> Option<MockResponse> {
        let mut rules = self.rules.write();

        if let Some(index) = rules.iter().position(|r| r.once && r.matches(spec)) {
            return Some(rules.remove(index).response);
        }

        rules
            .iter()
            .find(|r| !r.once && r.matches(spec))
            .map(|r| r.response.clone())
    }

    /// Get the next response.
    fn next_response(&self) -> MockResponse {
        let responses = self.responses.read();
        if responses.is_empty() {
            return MockResponse::success("");
        }
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index % responses.len())
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }

    /// Check for simulated failure.
    fn check_failure(&self) -> RunnerResult<()> {
        if let Some(msg) = self.simulate_failure.read().clone() {
            return Err(RunnerError::ExecutionFailed(msg));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput> {
        self.record_call(spec);
        self.check_failure()?;

        let response = self
            .matching_rule(spec)
            .unwrap_or_else(|| self.next_response());
        let started_at = Utc::now();
        let finished_at = started_at + chrono::Duration::milliseconds(response.duration_ms as i64);

        CommandOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            started_at,
            finished_at,
            duration_ms: response.duration_ms,
        }
        .checked(spec)
    }
}

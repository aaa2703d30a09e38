//! Deployment reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::component::{ComponentPath, DeployResult};
use crate::error::{KilnError, KilnResult};

/// What a run did to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Components acted and persisted state.
    Deploy,
    /// Components only predicted their changes.
    DryRun,
    /// `deploy=false`: a dry run requested by a preview.
    Preview,
    /// Persisted state was reconciled with reality.
    Refresh,
}

impl RunMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, RunMode::DryRun | RunMode::Preview)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Deploy => "deploy",
            RunMode::DryRun => "dry-run",
            RunMode::Preview => "preview",
            RunMode::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub path: ComponentPath,
    pub kind: String,
    pub result: DeployResult,
}

/// Where and why a run stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFailure {
    pub path: ComponentPath,
    pub message: String,
    /// Captured output of the failing external action
    pub output: Option<String>,
}

/// Ordered record of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub target: ComponentPath,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub entries: Vec<ReportEntry>,
    pub failure: Option<ReportFailure>,
}

impl DeploymentReport {
    pub fn new(mode: RunMode, target: ComponentPath) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            target,
            started_at: Utc::now(),
            completed_at: None,
            entries: Vec::new(),
            failure: None,
        }
    }

    pub fn record(&mut self, path: ComponentPath, kind: impl Into<String>, result: DeployResult) {
        self.entries.push(ReportEntry {
            path,
            kind: kind.into(),
            result,
        });
    }

    pub fn fail(&mut self, path: ComponentPath, error: &KilnError) {
        self.failure = Some(ReportFailure {
            path,
            message: error.to_string(),
            output: error.output().map(str::to_string),
        });
        self.finish();
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn get(&self, path: &ComponentPath) -> Option<&DeployResult> {
        self.entries
            .iter()
            .find(|entry| &entry.path == path)
            .map(|entry| &entry.result)
    }

    pub fn changed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.result.changed).count()
    }

    /// True if any component changed, or would change in a dry run.
    pub fn has_drift(&self) -> bool {
        self.changed_count() > 0
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }

    pub fn to_json(&self) -> KilnResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let marker = match (entry.result.changed, self.mode.is_dry_run()) {
                (false, _) => "  ",
                (true, false) => "✔ ",
                (true, true) => "~ ",
            };
            write!(f, "{}{}", marker, entry.path)?;
            if let Some(message) = &entry.result.message {
                write!(f, ": {}", message)?;
            }
            writeln!(f)?;
        }

        if let Some(failure) = &self.failure {
            writeln!(f, "✘ {}: {}", failure.path, failure.message)?;
        }

        let verb = if self.mode.is_dry_run() {
            "would change"
        } else {
            "changed"
        };
        write!(
            f,
            "{} of {} components {} ({})",
            self.changed_count(),
            self.entries.len(),
            verb,
            self.mode
        )
    }
}

/// CI-friendly exit codes.
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const CONFIGURATION_ERROR: u8 = 2;
    pub const DEPLOY_FAILED: u8 = 3;
    /// A dry run found pending changes.
    pub const DRIFT: u8 = 4;
}

/// Print a finished report to stdout.
pub fn print_report(report: &DeploymentReport) {
    println!("{}", report);
}

/// Print an aborted run to stderr, including what the failing action wrote.
pub fn print_abort(error: &KilnError) {
    match error {
        KilnError::Abort(abort) => {
            eprintln!("{}", abort.report);
            if let Some(output) = abort.report.failure.as_ref().and_then(|f| f.output.as_ref()) {
                eprintln!("--- output ---");
                eprintln!("{}", output.trim_end());
            }
        }
        other => {
            eprintln!("✘ Error: {}", other);
            if let Some(output) = other.output() {
                eprintln!("{}", output.trim_end());
            }
        }
    }
}

/// Map the result of a run to a process exit status.
///
/// A dry run that found changes exits with [`ExitCodes::DRIFT`] so callers
/// can gate on it.
pub fn exit_code(result: &KilnResult<DeploymentReport>) -> u8 {
    match result {
        Ok(report) if report.mode.is_dry_run() && report.has_drift() => ExitCodes::DRIFT,
        Ok(_) => ExitCodes::SUCCESS,
        Err(KilnError::Configuration(_)) => ExitCodes::CONFIGURATION_ERROR,
        Err(KilnError::Abort(_)) => ExitCodes::DEPLOY_FAILED,
        Err(_) => ExitCodes::GENERAL_ERROR,
    }
}

/// Print the outcome of a run and return its exit status.
pub fn finish_run(result: KilnResult<DeploymentReport>) -> u8 {
    match &result {
        Ok(report) => print_report(report),
        Err(err) => print_abort(err),
    }
    exit_code(&result)
}

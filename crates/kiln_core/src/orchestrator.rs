//! Deployment orchestrator.
//!
//! Walks a subtree in construction order and calls the deploy hook of every
//! component that has one. A deferred action returned by a hook is forced
//! before the next component is visited, so each component sees the state
//! its predecessors left behind.

use std::fmt;

use tracing::{debug, error, info};

use crate::component::{Component, ComponentPath, DeployResult};
use crate::error::{KilnError, KilnResult};
use crate::report::{DeploymentReport, RunMode};
use crate::stack::Subtree;

/// A run stopped at a failing component. Carries the report up to and
/// including the failure marker.
#[derive(Debug, Clone)]
pub struct AbortOperation {
    pub report: DeploymentReport,
    pub cause: KilnError,
}

impl AbortOperation {
    /// Path of the component that failed.
    pub fn failed_path(&self) -> Option<&ComponentPath> {
        self.report.failure.as_ref().map(|failure| &failure.path)
    }
}

impl fmt::Display for AbortOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failed_path() {
            Some(path) => write!(f, "Deployment aborted at {}: {}", path, self.cause),
            None => write!(f, "Deployment aborted: {}", self.cause),
        }
    }
}

impl std::error::Error for AbortOperation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Runs deploy and refresh passes over a subtree.
#[derive(Debug, Default, Clone)]
pub struct Orchestrator;

impl Orchestrator {
    pub fn new() -> Self {
        Self
    }

    /// Deploy every component of `target`.
    ///
    /// With `deploy=false` the whole run is a dry run. During a dry run the
    /// state store rejects writes.
    pub async fn apply(
        &self,
        target: &Subtree<'_>,
        deploy: bool,
        dry_run: bool,
    ) -> KilnResult<DeploymentReport> {
        let mode = match (deploy, dry_run) {
            (false, _) => RunMode::Preview,
            (true, true) => RunMode::DryRun,
            (true, false) => RunMode::Deploy,
        };
        let dry_run = mode.is_dry_run();
        let _guard = dry_run.then(|| target.store().read_only_guard());

        self.run(target, mode, move |component| async move {
            match component.as_deploy() {
                Some(hook) => match hook.deploy(dry_run).await {
                    Ok(outcome) => outcome.settle().await.map(Some),
                    Err(err) => Err(err),
                },
                None => Ok(None),
            }
        })
        .await
    }

    /// Reconcile persisted state of every component of `target` with reality.
    pub async fn refresh(&self, target: &Subtree<'_>) -> KilnResult<DeploymentReport> {
        self.run(target, RunMode::Refresh, |component| async move {
            match component.as_deploy() {
                Some(hook) => hook.refresh().await.map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn run<F, Fut>(
        &self,
        target: &Subtree<'_>,
        mode: RunMode,
        visit: F,
    ) -> KilnResult<DeploymentReport>
    where
        F: Fn(std::sync::Arc<dyn Component>) -> Fut,
        Fut: std::future::Future<Output = KilnResult<Option<DeployResult>>>,
    {
        let components = target.components();
        let mut report = DeploymentReport::new(mode, target.path().clone());
        let target_name = if target.path().is_root() {
            target.stack().name().to_string()
        } else {
            target.path().to_string()
        };

        info!(
            "Starting {} of {} ({} components, run {})",
            mode,
            target_name,
            components.len(),
            report.run_id
        );

        for component in components {
            let path = component.node().path().clone();
            let kind = component.kind();

            match visit(component).await {
                Ok(Some(result)) => {
                    debug!(
                        "{} {}: {}",
                        kind,
                        path,
                        if result.changed { "changed" } else { "unchanged" }
                    );
                    report.record(path, kind, result);
                }
                Ok(None) => {}
                Err(err) => {
                    error!("{} of {} failed at {}: {}", mode, target_name, path, err);
                    report.fail(path, &err);
                    return Err(KilnError::Abort(Box::new(AbortOperation {
                        report,
                        cause: err,
                    })));
                }
            }
        }

        report.finish();
        info!(
            "Finished {} of {}: {} of {} components {}",
            mode,
            target_name,
            report.changed_count(),
            report.entries.len(),
            if mode.is_dry_run() { "would change" } else { "changed" }
        );
        Ok(report)
    }
}

//! Upgrade capability.

use async_trait::async_trait;
use tracing::info;

use crate::component::Component;
use crate::error::KilnResult;
use crate::orchestrator::Orchestrator;
use crate::report::DeploymentReport;
use crate::stack::Stack;

/// Components that can be upgraded in place by redeploying their own subtree.
///
/// Types opt in with an empty impl; `upgrade` is provided:
///
/// ```rust,ignore
/// impl Upgradable for ResticRepository {}
///
/// let report = repo.upgrade(&stack, false, true).await?;
/// ```
#[async_trait]
pub trait Upgradable: Component {
    /// Apply the orchestrator to this component and its descendants.
    async fn upgrade(
        &self,
        stack: &Stack,
        dry_run: bool,
        deploy: bool,
    ) -> KilnResult<DeploymentReport> {
        let path = self.node().path();
        info!("Upgrading {}", path);
        let target = stack.subtree(path)?;
        Orchestrator::new().apply(&target, deploy, dry_run).await
    }
}

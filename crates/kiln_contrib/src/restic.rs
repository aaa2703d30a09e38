//! restic backup repositories.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{
    references, Component, Deploy, DeployResult, KilnError, KilnResult, Maybe, Node, Origin,
    Outcome, PropField, PropKind, PropSchema, Props, StateHandle,
};
use kiln_runner::{CommandOutput, CommandRunner, CommandSpec};
use serde::Deserialize;
use tracing::{info, warn};

const INITIALIZED_KEY: &str = "initialized";

/// restic prints this when the repository does not exist yet.
pub const MISSING_REPOSITORY_MARKER: &str = "Is there a repository at the following location?";

fn default_binary() -> String {
    "restic".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResticProps {
    pub repository: Maybe<String>,
    pub password: Maybe<String>,
    /// Extra environment, e.g. object store credentials
    #[serde(default)]
    pub env: Maybe<BTreeMap<String, String>>,
    #[serde(default = "default_binary")]
    pub restic_binary: String,
}

impl ResticProps {
    pub fn new(repository: impl Into<Maybe<String>>, password: impl Into<Maybe<String>>) -> Self {
        Self {
            repository: repository.into(),
            password: password.into(),
            env: Maybe::default(),
            restic_binary: default_binary(),
        }
    }

    pub fn env(mut self, env: impl Into<Maybe<BTreeMap<String, String>>>) -> Self {
        self.env = env.into();
        self
    }

    pub fn restic_binary(mut self, binary: impl Into<String>) -> Self {
        self.restic_binary = binary.into();
        self
    }
}

impl Props for ResticProps {
    fn schema() -> PropSchema {
        PropSchema::new("ResticRepository")
            .field(
                "repository",
                PropField::required(PropKind::String).deferrable(),
            )
            .field("password", PropField::required(PropKind::String).deferrable())
            .field("env", PropField::optional(PropKind::Map).deferrable())
            .field(
                "restic_binary",
                PropField::optional(PropKind::String).default("restic"),
            )
    }

    fn validate(&self) -> KilnResult<()> {
        if self.restic_binary.trim().is_empty() {
            return Err(KilnError::configuration("restic_binary must not be empty"));
        }
        Ok(())
    }

    fn references(&self) -> Vec<Origin> {
        references([
            self.repository.origin(),
            self.password.origin(),
            self.env.origin(),
        ])
    }
}

/// Everything needed to invoke restic, detached from the component so a
/// deferred action can own it.
#[derive(Clone)]
struct Restic {
    props: ResticProps,
    runner: Arc<dyn CommandRunner>,
}

impl Restic {
    async fn extra_env(&self) -> KilnResult<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert(
            "RESTIC_REPOSITORY".to_string(),
            self.props.repository.resolve().await?,
        );
        env.insert(
            "RESTIC_PASSWORD".to_string(),
            self.props.password.resolve().await?,
        );
        env.extend(self.props.env.resolve().await?);
        Ok(env)
    }

    async fn command(&self, args: &[&str]) -> KilnResult<CommandSpec> {
        Ok(CommandSpec::new(&self.props.restic_binary)
            .args(args.iter().copied())
            .envs(self.extra_env().await?))
    }

    async fn run(&self, args: &[&str]) -> KilnResult<CommandOutput> {
        let spec = self.command(args).await?;
        Ok(self.runner.run(&spec).await?)
    }

    async fn init(self, state: StateHandle) -> KilnResult<DeployResult> {
        self.run(&["init", "--repository-version=1"]).await?;
        state.set(INITIALIZED_KEY, &true)?;
        info!("Initialized restic repository {}", state.path());
        Ok(DeployResult::changed().with_message("initialized repository"))
    }
}

/// A restic repository, initialized on first deploy.
///
/// Persists `initialized`. [`Deploy::refresh`] asks restic whether the
/// repository exists and corrects the flag.
pub struct ResticRepository {
    node: Node,
    restic: Restic,
}

impl ResticRepository {
    pub fn new(node: Node, props: ResticProps, runner: Arc<dyn CommandRunner>) -> KilnResult<Self> {
        let props = node.bind(props)?;
        Ok(Self {
            node,
            restic: Restic { props, runner },
        })
    }

    pub fn props(&self) -> &ResticProps {
        &self.restic.props
    }

    pub fn initialized(&self) -> KilnResult<bool> {
        self.node.state().get_or(INITIALIZED_KEY, false)
    }

    /// Environment restic needs to reach the repository. Resolves the
    /// deferred props.
    pub async fn extra_env(&self) -> KilnResult<BTreeMap<String, String>> {
        self.restic.extra_env().await
    }

    /// Run an arbitrary restic command against this repository.
    pub async fn run(&self, args: &[&str]) -> KilnResult<CommandOutput> {
        self.restic.run(args).await
    }
}

impl Component for ResticRepository {
    fn node(&self) -> &Node {
        &self.node
    }

    fn as_deploy(&self) -> Option<&dyn Deploy> {
        Some(self)
    }
}

#[async_trait]
impl Deploy for ResticRepository {
    async fn deploy(&self, dry_run: bool) -> KilnResult<Outcome> {
        if self.initialized()? {
            return Ok(Outcome::unchanged());
        }

        if dry_run {
            return Ok(DeployResult::changed()
                .with_message("initialize repository")
                .into());
        }

        let restic = self.restic.clone();
        let state = self.node.state().clone();
        Ok(self.node.defer("init", move || restic.init(state)).into())
    }

    async fn refresh(&self) -> KilnResult<DeployResult> {
        let initialized = match self.run(&["list", "index"]).await {
            Ok(_) => true,
            Err(KilnError::Operation(err)) if err.output.contains(MISSING_REPOSITORY_MARKER) => {
                warn!("No restic repository found for {}", self.node.path());
                false
            }
            Err(err) => return Err(err),
        };

        self.node.state().set(INITIALIZED_KEY, &initialized)?;
        Ok(DeployResult {
            changed: !initialized,
            message: None,
        })
    }
}

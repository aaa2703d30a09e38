//! A restic repository together with its generated password.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_core::{
    references, BuildContext, Component, Counter, KilnResult, Maybe, Node, Origin, PropField,
    PropKind, PropSchema, Props, Upgradable,
};
use kiln_runner::CommandRunner;

use crate::restic::{ResticProps, ResticRepository};
use crate::secret::{LocalSecret, SecretProps};

#[derive(Debug, Clone)]
pub struct BackupProps {
    pub repository: Maybe<String>,
    pub env: Maybe<BTreeMap<String, String>>,
    pub restic_binary: String,
}

impl BackupProps {
    pub fn new(repository: impl Into<Maybe<String>>) -> Self {
        Self {
            repository: repository.into(),
            env: Maybe::default(),
            restic_binary: "restic".to_string(),
        }
    }

    pub fn env(mut self, env: impl Into<Maybe<BTreeMap<String, String>>>) -> Self {
        self.env = env.into();
        self
    }
}

impl Props for BackupProps {
    fn schema() -> PropSchema {
        PropSchema::new("ResticBackup")
            .field(
                "repository",
                PropField::required(PropKind::String).deferrable(),
            )
            .field("env", PropField::optional(PropKind::Map).deferrable())
            .field(
                "restic_binary",
                PropField::optional(PropKind::String).default("restic"),
            )
    }

    fn references(&self) -> Vec<Origin> {
        references([self.repository.origin(), self.env.origin()])
    }
}

/// Adds a `password` secret and a `repo` encrypted with it.
///
/// The repository reads the password through a deferred value, so the
/// secret is generated before the repository is initialized.
pub struct ResticBackup {
    node: Node,
    props: BackupProps,
    runner: Arc<dyn CommandRunner>,
    /// Precedence handed to backup jobs added through [`ResticBackup::job_priority`]
    priorities: Counter,
    password: Option<Arc<LocalSecret>>,
    repo: Option<Arc<ResticRepository>>,
}

impl ResticBackup {
    pub fn new(node: Node, props: BackupProps, runner: Arc<dyn CommandRunner>) -> KilnResult<Self> {
        let props = node.bind(props)?;
        Ok(Self {
            node,
            props,
            runner,
            priorities: Counter::default(),
            password: None,
            repo: None,
        })
    }

    pub fn password(&self) -> Option<&Arc<LocalSecret>> {
        self.password.as_ref()
    }

    pub fn repo(&self) -> Option<&Arc<ResticRepository>> {
        self.repo.as_ref()
    }

    /// Next precedence number for a job scheduled against this repository.
    pub fn job_priority(&self) -> u64 {
        self.priorities.next()
    }
}

impl Component for ResticBackup {
    fn node(&self) -> &Node {
        &self.node
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> KilnResult<()> {
        let password = ctx.add("password", |node| {
            LocalSecret::new(node, SecretProps::default())
        })?;

        let props = ResticProps::new(self.props.repository.clone(), password.value())
            .env(self.props.env.clone())
            .restic_binary(self.props.restic_binary.clone());
        let runner = self.runner.clone();
        let repo = ctx.add("repo", |node| ResticRepository::new(node, props, runner))?;

        self.password = Some(password);
        self.repo = Some(repo);
        Ok(())
    }
}

impl Upgradable for ResticBackup {}

//! Pinned versions of upstream software.
//!
//! A [`Version`] remembers which release a stack runs. Deploying does not
//! change it; operators move it with [`Version::set`] or
//! [`Version::set_latest`], then redeploy whatever reads
//! [`Version::current`].

use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{
    Component, Deferred, KilnError, KilnResult, Node, OperationError, PropField, PropKind,
    PropSchema, Props,
};
use serde::Deserialize;
use tracing::info;

const CURRENT_KEY: &str = "current_version";

const GITHUB_API: &str = "https://api.github.com";

/// Where the latest release comes from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn latest(&self) -> KilnResult<String>;
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Latest release of a GitHub repository, by tag name.
pub struct GithubReleases {
    client: reqwest::Client,
    base_url: String,
    account: String,
    repo: String,
}

impl GithubReleases {
    /// `repo` is `account/name`.
    pub fn new(repo: &str) -> KilnResult<Self> {
        let (account, name) = repo
            .split_once('/')
            .filter(|(account, name)| !account.is_empty() && !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| {
                KilnError::configuration(format!(
                    "expected a GitHub repository as `account/name`, got `{}`",
                    repo
                ))
            })?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OperationError::new(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: GITHUB_API.to_string(),
            account: account.to_string(),
            repo: name.to_string(),
        })
    }

    /// Point at another API root, e.g. a GitHub Enterprise server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn latest_release_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases/latest",
            self.base_url, self.account, self.repo
        )
    }
}

#[async_trait]
impl VersionSource for GithubReleases {
    async fn latest(&self) -> KilnResult<String> {
        let url = self.latest_release_url();
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| OperationError::new(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperationError::new(format!("GET {} returned {}", url, status))
                .with_output(body)
                .into());
        }

        let release: Release = response
            .json()
            .await
            .map_err(|e| OperationError::new(format!("Invalid release from {}: {}", url, e)))?;
        Ok(release.tag_name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VersionProps {
    /// GitHub repository (`account/name`) publishing the releases
    pub github: Option<String>,
}

impl Props for VersionProps {
    fn schema() -> PropSchema {
        PropSchema::new("Version").field("github", PropField::optional(PropKind::String))
    }
}

/// What [`Version::set`] or [`Version::set_latest`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionChange {
    /// Already at the target.
    Unchanged(String),
    /// Moved from the previous version, if any, to the new one.
    Upgraded {
        from: Option<String>,
        to: String,
    },
    /// Would move; nothing was written.
    Pending {
        from: Option<String>,
        to: String,
    },
}

/// A persisted version pin.
pub struct Version {
    node: Node,
    source: Option<Arc<dyn VersionSource>>,
}

impl Version {
    /// A pin without a release source; only [`Version::set`] moves it.
    pub fn new(node: Node) -> KilnResult<Self> {
        Ok(Self { node, source: None })
    }

    pub fn with_source(node: Node, source: Arc<dyn VersionSource>) -> KilnResult<Self> {
        Ok(Self {
            node,
            source: Some(source),
        })
    }

    /// A pin following the releases of the GitHub repository in `props`.
    pub fn from_props(node: Node, props: VersionProps) -> KilnResult<Self> {
        let props = node.bind(props)?;
        match props.github {
            Some(repo) => Self::with_source(node, Arc::new(GithubReleases::new(&repo)?)),
            None => Self::new(node),
        }
    }

    pub fn get(&self) -> KilnResult<Option<String>> {
        self.node.state().get(CURRENT_KEY)
    }

    /// The pinned version, or an empty string before one is set.
    pub fn current(&self) -> Deferred<String> {
        let state = self.node.state().clone();
        self.node.defer("current", move || async move {
            state.get_or(CURRENT_KEY, String::new())
        })
    }

    /// Pin `target`.
    pub fn set(&self, target: &str) -> KilnResult<VersionChange> {
        self.move_to(target.to_string(), false)
    }

    /// Pin the latest release reported by the source.
    pub async fn set_latest(&self, dry_run: bool) -> KilnResult<VersionChange> {
        let source = self.source.as_ref().ok_or_else(|| {
            KilnError::configuration(format!("{} has no release source", self.node.path()))
        })?;
        let latest = source.latest().await?;
        self.move_to(latest, dry_run)
    }

    fn move_to(&self, target: String, dry_run: bool) -> KilnResult<VersionChange> {
        let current = self.get()?;
        if current.as_deref() == Some(target.as_str()) {
            info!("{} already at {:?}", self.node.path(), target);
            return Ok(VersionChange::Unchanged(target));
        }

        if dry_run {
            info!(
                "{} would move from {:?} to {:?}",
                self.node.path(),
                current,
                target
            );
            return Ok(VersionChange::Pending {
                from: current,
                to: target,
            });
        }

        self.node.state().set(CURRENT_KEY, &target)?;
        info!("{} moved from {:?} to {:?}", self.node.path(), current, target);
        Ok(VersionChange::Upgraded {
            from: current,
            to: target,
        })
    }
}

impl Component for Version {
    fn node(&self) -> &Node {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Stack, StateStore};

    fn version(stack: &mut Stack, source: MockVersionSource) -> Arc<Version> {
        let source: Arc<dyn VersionSource> = Arc::new(source);
        stack
            .add("version", |node| Version::with_source(node, source))
            .unwrap()
    }

    #[tokio::test]
    async fn test_current_defaults_to_empty() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let version = stack.add("version", Version::new).unwrap();

        assert_eq!(version.current().resolve().await.unwrap(), "");

        version.set("2024.1").unwrap();
        assert_eq!(version.current().resolve().await.unwrap(), "2024.1");
    }

    #[tokio::test]
    async fn test_set_latest_moves_pin() {
        let mut source = MockVersionSource::new();
        source
            .expect_latest()
            .times(2)
            .returning(|| Ok("v1.4.0".to_string()));

        let mut stack = Stack::new("test", StateStore::in_memory());
        let version = version(&mut stack, source);
        version.set("v1.3.2").unwrap();

        let change = version.set_latest(false).await.unwrap();
        assert_eq!(
            change,
            VersionChange::Upgraded {
                from: Some("v1.3.2".to_string()),
                to: "v1.4.0".to_string(),
            }
        );

        let again = version.set_latest(false).await.unwrap();
        assert_eq!(again, VersionChange::Unchanged("v1.4.0".to_string()));
    }

    #[tokio::test]
    async fn test_set_latest_dry_run_writes_nothing() {
        let mut source = MockVersionSource::new();
        source
            .expect_latest()
            .returning(|| Ok("v2.0.0".to_string()));

        let mut stack = Stack::new("test", StateStore::in_memory());
        let version = version(&mut stack, source);

        let change = version.set_latest(true).await.unwrap();

        assert!(matches!(change, VersionChange::Pending { from: None, .. }));
        assert_eq!(version.get().unwrap(), None);
    }

    #[tokio::test]
    async fn test_source_failure_propagates() {
        let mut source = MockVersionSource::new();
        source
            .expect_latest()
            .returning(|| Err(OperationError::new("GitHub is down").into()));

        let mut stack = Stack::new("test", StateStore::in_memory());
        let version = version(&mut stack, source);

        let err = version.set_latest(false).await.unwrap_err();
        assert_eq!(err.to_string(), "GitHub is down");
    }

    #[tokio::test]
    async fn test_set_latest_needs_a_source() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let version = stack.add("version", Version::new).unwrap();

        let err = version.set_latest(false).await.unwrap_err();
        assert!(matches!(err, KilnError::Configuration(_)));
    }

    #[test]
    fn test_github_repo_parsing() {
        let releases = GithubReleases::new("home-assistant/core")
            .unwrap()
            .with_base_url("https://ghe.example.com/api/v3/");
        assert_eq!(
            releases.latest_release_url(),
            "https://ghe.example.com/api/v3/repos/home-assistant/core/releases/latest"
        );

        for bad in ["core", "a/b/c", "/core"] {
            assert!(GithubReleases::new(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_from_props() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let props = VersionProps::from_yaml("github: paperless-ngx/paperless-ngx\n").unwrap();
        let version = stack
            .add("version", |node| Version::from_props(node, props))
            .unwrap();
        assert!(version.source.is_some());
    }
}

//! Component definitions and the deploy contract.
//!
//! Components are the building blocks of a kiln stack. Each one describes a
//! single resource (a secret, a backup repository, a pinned version) or groups
//! other components it creates while the stack is assembled.
//!
//! # Component Lifecycle
//!
//! 1. **Construction**: the stack hands the constructor a [`Node`] carrying the
//!    component's path and state handle; props are checked with [`Node::bind`].
//! 2. **Wiring**: [`Component::build`] runs once and may add children and
//!    create deferred values. It must not touch the outside world.
//! 3. **Deploy**: the orchestrator calls [`Deploy::deploy`] on every component
//!    that implements it, in construction order.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use kiln_core::{Component, Deploy, DeployResult, KilnResult, Node, Outcome};
//!
//! struct Marker {
//!     node: Node,
//! }
//!
//! impl Component for Marker {
//!     fn node(&self) -> &Node { &self.node }
//!     fn as_deploy(&self) -> Option<&dyn Deploy> { Some(self) }
//! }
//!
//! #[async_trait]
//! impl Deploy for Marker {
//!     async fn deploy(&self, dry_run: bool) -> KilnResult<Outcome> {
//!         if self.node.state().get::<bool>("done")?.unwrap_or(false) {
//!             return Ok(Outcome::unchanged());
//!         }
//!         if !dry_run {
//!             self.node.state().set("done", &true)?;
//!         }
//!         Ok(Outcome::changed())
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};
use crate::lazy::{Deferred, Origin};
use crate::props::Props;
use crate::stack::BuildContext;
use crate::state::StateHandle;

/// Position of a component in its stack, e.g. `backups/media/password`.
///
/// Paths are built from the names parents give their children, so they stay
/// the same across runs as long as nobody renames a component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ComponentPath {
    segments: Vec<String>,
}

impl ComponentPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a slash separated path. Empty segments are ignored.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Local name, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &ComponentPath) -> bool {
        self.segments.starts_with(&ancestor.segments)
    }
}

impl fmt::Display for ComponentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl From<String> for ComponentPath {
    fn from(path: String) -> Self {
        Self::parse(&path)
    }
}

impl From<&str> for ComponentPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<ComponentPath> for String {
    fn from(path: ComponentPath) -> Self {
        path.to_string()
    }
}

/// Identity handed to a component when it is constructed.
#[derive(Debug, Clone)]
pub struct Node {
    path: ComponentPath,
    seq: usize,
    state: StateHandle,
}

impl Node {
    pub(crate) fn new(path: ComponentPath, seq: usize, state: StateHandle) -> Self {
        Self { path, seq, state }
    }

    pub fn path(&self) -> &ComponentPath {
        &self.path
    }

    /// Position in construction order, which is also deploy order.
    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Persisted state scoped to this component.
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn origin(&self) -> Origin {
        Origin {
            seq: self.seq,
            path: self.path.clone(),
        }
    }

    /// Validate props and check that every deferred field reads from a
    /// component constructed before this one.
    pub fn bind<P: Props>(&self, props: P) -> KilnResult<P> {
        props.validate().map_err(|err| match err {
            KilnError::Configuration(message) => {
                KilnError::configuration(format!("{}: {}", self.path, message))
            }
            other => other,
        })?;

        let references = props.references();
        let deferrable = P::schema().deferrable_fields().count();
        if references.len() > deferrable {
            return Err(KilnError::configuration(format!(
                "{}: props carry {} deferred values but declare {} deferrable fields",
                self.path,
                references.len(),
                deferrable
            )));
        }

        for origin in references {
            if origin.seq >= self.seq {
                return Err(KilnError::configuration(format!(
                    "{} references {}, which is constructed after it",
                    self.path, origin.path
                )));
            }
        }

        Ok(props)
    }

    /// Create a deferred value that reads from this component.
    pub fn defer<T, F, Fut>(&self, label: &str, producer: F) -> Deferred<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = KilnResult<T>> + Send + 'static,
    {
        Deferred::new(format!("{}.{}", self.path, label), producer).with_origin(self.origin())
    }
}

/// Outcome of one deploy call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub changed: bool,
    pub message: Option<String>,
}

impl DeployResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed() -> Self {
        Self {
            changed: true,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// What a deploy call returns: a finished result, or a deferred action the
/// orchestrator forces when it reaches the component.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done(DeployResult),
    Deferred(Deferred<DeployResult>),
}

impl Outcome {
    pub fn unchanged() -> Self {
        Outcome::Done(DeployResult::unchanged())
    }

    pub fn changed() -> Self {
        Outcome::Done(DeployResult::changed())
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred(_))
    }

    /// Run the deferred action, if any, and return the final result.
    pub async fn settle(self) -> KilnResult<DeployResult> {
        match self {
            Outcome::Done(result) => Ok(result),
            Outcome::Deferred(action) => action.resolve().await,
        }
    }
}

impl From<DeployResult> for Outcome {
    fn from(result: DeployResult) -> Self {
        Outcome::Done(result)
    }
}

impl From<Deferred<DeployResult>> for Outcome {
    fn from(action: Deferred<DeployResult>) -> Self {
        Outcome::Deferred(action)
    }
}

/// A node in the component tree.
pub trait Component: Send + Sync + 'static {
    fn node(&self) -> &Node;

    /// Short type name shown in reports.
    fn kind(&self) -> &'static str {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name)
    }

    /// One-time structural wiring.
    ///
    /// May add children through `ctx` and create deferred values. Must not run
    /// commands or make network calls.
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> KilnResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// The deploy hook, for components that have external side effects.
    fn as_deploy(&self) -> Option<&dyn Deploy> {
        None
    }
}

/// Deploy contract.
///
/// | persisted state | dry run | action | result |
/// |---|---|---|---|
/// | matches desired | any | none | unchanged |
/// | differs | yes | predict only, no writes | changed |
/// | differs | no | act, then persist | changed |
#[async_trait]
pub trait Deploy: Send + Sync {
    async fn deploy(&self, dry_run: bool) -> KilnResult<Outcome>;

    /// Reconcile persisted state with the real resource.
    async fn refresh(&self) -> KilnResult<DeployResult> {
        Ok(DeployResult::unchanged())
    }
}

/// Monotonic counter owned by a parent component, e.g. for handing out rule
/// precedence to the children it creates.
#[derive(Debug)]
pub struct Counter {
    next: AtomicU64,
}

impl Counter {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Hooks a component invokes right before it changes something.
#[derive(Default, Clone)]
pub struct Callbacks {
    hooks: Arc<RwLock<Vec<Hook>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.write().push(Arc::new(hook));
    }

    pub fn invoke(&self) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook();
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").field("hooks", &self.len()).finish()
    }
}

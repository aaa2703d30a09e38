//! Deferred values.
//!
//! A [`Deferred<T>`] stands in for a value that does not exist while the
//! component tree is being assembled: the id of a bucket that has not been
//! created, a secret generated on first deploy. It wraps an async producer
//! that runs at most once; its outcome, success or failure, is cached and
//! handed to every later reader.
//!
//! Props fields that may be deferred use [`Maybe<T>`], which is either a
//! literal or a deferred. Consumers never match on it and call [`resolve`].
//!
//! ```rust,ignore
//! let bucket_id = node.defer("bucket_id", move || async move {
//!     state.get::<String>("bucket_id")?
//!         .ok_or_else(|| KilnError::not_available("bucket has not been created yet"))
//! });
//!
//! let repository: Maybe<String> = bucket_id.map(|id| format!("b2:{id}:")).into();
//! let value = resolve(&repository).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tracing::{trace, warn};

use crate::component::ComponentPath;
use crate::error::{KilnError, KilnResult};

type Producer<T> = Box<dyn FnOnce() -> BoxFuture<'static, KilnResult<T>> + Send>;

/// The component a deferred value reads from, identified by its position in
/// construction order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub seq: usize,
    pub path: ComponentPath,
}

/// Observable resolution state of a deferred value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Running,
    Resolved,
    Failed,
}

enum Slot<T> {
    Pending(Producer<T>),
    Running,
    Resolved(T),
    Failed(KilnError),
}

impl<T> Slot<T> {
    fn state(&self) -> DeferredState {
        match self {
            Slot::Pending(_) => DeferredState::Pending,
            Slot::Running => DeferredState::Running,
            Slot::Resolved(_) => DeferredState::Resolved,
            Slot::Failed(_) => DeferredState::Failed,
        }
    }
}

struct Inner<T> {
    label: String,
    slot: Mutex<Slot<T>>,
}

/// Records an interruption if resolution stops before the producer returns,
/// either because the resolving future was dropped or the producer panicked.
struct ResolveGuard<'a, T> {
    inner: &'a Inner<T>,
    settled: bool,
}

impl<T: Clone> ResolveGuard<'_, T> {
    fn settle(mut self, result: &KilnResult<T>) {
        *self.inner.slot.lock() = match result {
            Ok(value) => Slot::Resolved(value.clone()),
            Err(err) => Slot::Failed(err.clone()),
        };
        self.settled = true;
    }
}

impl<T> Drop for ResolveGuard<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slot = self.inner.slot.lock();
        if matches!(*slot, Slot::Running) {
            warn!("Resolution of deferred value `{}` was interrupted", self.inner.label);
            *slot = Slot::Failed(KilnError::interrupted(format!(
                "resolution of deferred value `{}` did not finish",
                self.inner.label
            )));
        }
    }
}

/// A memoized, possibly failing computation standing in for a value that is
/// not known yet.
///
/// Clones share the same cache.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
    origin: Option<Origin>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: self.origin.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("origin", &self.origin)
            .finish()
    }
}

impl<T> Deferred<T> {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    /// Record which component this value reads from.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn state(&self) -> DeferredState {
        self.inner.slot.lock().state()
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == DeferredState::Resolved
    }

    fn from_slot(label: String, slot: Slot<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label,
                slot: Mutex::new(slot),
            }),
            origin: None,
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap a producer. Nothing runs until the first [`Deferred::resolve`].
    pub fn new<F, Fut>(label: impl Into<String>, producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = KilnResult<T>> + Send + 'static,
    {
        let producer: Producer<T> = Box::new(move || producer().boxed());
        Self::from_slot(label.into(), Slot::Pending(producer))
    }

    /// A deferred value that is already resolved.
    pub fn ready(value: T) -> Self {
        Self::from_slot("ready".to_string(), Slot::Resolved(value))
    }

    /// Return the cached outcome, running the producer if this is the first
    /// read.
    ///
    /// Resolving a value whose producer is still running means the producer
    /// (transitively) depends on itself; that is reported as a configuration
    /// error instead of waiting forever. If the first resolution is cancelled
    /// or its producer panics, the value fails with
    /// [`KilnError::Interrupted`].
    pub async fn resolve(&self) -> KilnResult<T> {
        let producer = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Running) {
                Slot::Pending(producer) => producer,
                Slot::Running => {
                    return Err(KilnError::configuration(format!(
                        "deferred value `{}` depends on itself",
                        self.inner.label
                    )));
                }
                Slot::Resolved(value) => {
                    *slot = Slot::Resolved(value.clone());
                    return Ok(value);
                }
                Slot::Failed(err) => {
                    *slot = Slot::Failed(err.clone());
                    return Err(err);
                }
            }
        };

        trace!("Resolving deferred value `{}`", self.inner.label);
        let guard = ResolveGuard {
            inner: &*self.inner,
            settled: false,
        };
        let result = producer().await;
        guard.settle(&result);
        result
    }

    /// Derive a deferred value by transforming this one.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        let derived = Deferred::new(format!("{}.map", self.label()), move || async move {
            source.resolve().await.map(f)
        });
        derived.inherit_origin(self)
    }

    /// Derive a deferred value with a fallible async step.
    pub fn and_then<U, F, Fut>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = KilnResult<U>> + Send + 'static,
    {
        let source = self.clone();
        let derived = Deferred::new(format!("{}.and_then", self.label()), move || async move {
            match source.resolve().await {
                Ok(value) => f(value).await,
                Err(err) => Err(err),
            }
        });
        derived.inherit_origin(self)
    }

    fn inherit_origin<S>(self, source: &Deferred<S>) -> Self {
        match source.origin() {
            Some(origin) => self.with_origin(origin.clone()),
            None => self,
        }
    }
}

/// Wrap a producer in an anonymous deferred value.
pub fn defer<T, F, Fut>(producer: F) -> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = KilnResult<T>> + Send + 'static,
{
    Deferred::new("deferred", producer)
}

/// Resolve a maybe-deferred value.
pub async fn resolve<T>(value: &Maybe<T>) -> KilnResult<T>
where
    T: Clone + Send + Sync + 'static,
{
    value.resolve().await
}

/// A literal or a deferred value.
#[derive(Clone)]
pub enum Maybe<T> {
    Value(T),
    Deferred(Deferred<T>),
}

impl<T> Maybe<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Maybe::Deferred(_))
    }

    /// Origin of the deferred value, `None` for literals.
    pub fn origin(&self) -> Option<&Origin> {
        match self {
            Maybe::Value(_) => None,
            Maybe::Deferred(deferred) => deferred.origin(),
        }
    }
}

impl<T> Maybe<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub async fn resolve(&self) -> KilnResult<T> {
        match self {
            Maybe::Value(value) => Ok(value.clone()),
            Maybe::Deferred(deferred) => deferred.resolve().await,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Maybe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Maybe::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Maybe::Deferred(deferred) => fmt::Debug::fmt(deferred, f),
        }
    }
}

impl<T: Default> Default for Maybe<T> {
    fn default() -> Self {
        Maybe::Value(T::default())
    }
}

impl<T> From<T> for Maybe<T> {
    fn from(value: T) -> Self {
        Maybe::Value(value)
    }
}

impl<T> From<Deferred<T>> for Maybe<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Maybe::Deferred(deferred)
    }
}

impl From<&str> for Maybe<String> {
    fn from(value: &str) -> Self {
        Maybe::Value(value.to_string())
    }
}

/// Untyped configuration only ever carries literals.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Maybe<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Maybe::Value)
    }
}

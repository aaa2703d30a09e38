//! Secrets generated locally and kept in stack state.

use async_trait::async_trait;
use kiln_core::{
    Callbacks, Component, Deferred, Deploy, DeployResult, KilnError, KilnResult, Node, Outcome,
    PropField, PropKind, PropSchema, Props,
};
use serde::Deserialize;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::info;

const VALUE_KEY: &str = "value";

/// Url-safe base64 alphabet.
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// 32 random bytes worth of url-safe characters.
const DEFAULT_TOKEN_LENGTH: usize = 43;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretProps {
    /// Number of characters in the generated token
    pub length: Option<usize>,
}

impl SecretProps {
    pub fn with_length(length: usize) -> Self {
        Self {
            length: Some(length),
        }
    }
}

impl Props for SecretProps {
    fn schema() -> PropSchema {
        PropSchema::new("LocalSecret").field("length", PropField::optional(PropKind::Integer))
    }

    fn validate(&self) -> KilnResult<()> {
        if self.length == Some(0) {
            return Err(KilnError::configuration("length must be at least 1"));
        }
        Ok(())
    }
}

/// A random token generated on first deploy and persisted as `value`.
///
/// Other components read it through [`LocalSecret::value`], which is not
/// available until the secret has been deployed once.
pub struct LocalSecret {
    node: Node,
    props: SecretProps,
    on_change: Callbacks,
}

impl LocalSecret {
    pub fn new(node: Node, props: SecretProps) -> KilnResult<Self> {
        let props = node.bind(props)?;
        Ok(Self {
            node,
            props,
            on_change: Callbacks::new(),
        })
    }

    /// Hooks run right before a new value is stored.
    pub fn on_change(&self) -> &Callbacks {
        &self.on_change
    }

    /// The persisted token.
    ///
    /// Every call returns a new deferred reading the state when first
    /// resolved, so a read before generation does not poison later reads.
    pub fn value(&self) -> Deferred<String> {
        let state = self.node.state().clone();
        let path = self.node.path().clone();
        self.node.defer(VALUE_KEY, move || async move {
            match state.get::<String>(VALUE_KEY)? {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(KilnError::not_available(format!(
                    "value for {} has not been generated yet",
                    path
                ))),
            }
        })
    }

    /// Forget the value; the next deploy generates a new one.
    pub fn clear(&self) -> KilnResult<()> {
        self.node.state().clear(VALUE_KEY)
    }

    /// Store a value chosen by the operator.
    pub fn set(&self, value: &str) -> KilnResult<()> {
        self.node.state().set(VALUE_KEY, value)
    }

    fn is_generated(&self) -> KilnResult<bool> {
        Ok(self
            .node
            .state()
            .get::<String>(VALUE_KEY)?
            .is_some_and(|value| !value.is_empty()))
    }

    fn generate(&self) -> String {
        let length = self.props.length.unwrap_or(DEFAULT_TOKEN_LENGTH);
        let mut rng = OsRng;
        (0..length)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    }
}

impl Component for LocalSecret {
    fn node(&self) -> &Node {
        &self.node
    }

    fn as_deploy(&self) -> Option<&dyn Deploy> {
        Some(self)
    }
}

#[async_trait]
impl Deploy for LocalSecret {
    async fn deploy(&self, dry_run: bool) -> KilnResult<Outcome> {
        if self.is_generated()? {
            return Ok(Outcome::unchanged());
        }

        if !dry_run {
            self.on_change.invoke();
            self.node.state().set(VALUE_KEY, &self.generate())?;
            info!("Generated secret {}", self.node.path());
        }

        Ok(DeployResult::changed()
            .with_message("generate secret")
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Stack, StateStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_generated_tokens_are_url_safe_and_truncated() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let secret = stack
            .add("s", |node| LocalSecret::new(node, SecretProps::with_length(12)))
            .unwrap();

        let token = secret.generate();
        assert_eq!(token.len(), 12);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(secret.generate(), token);
    }

    #[test]
    fn test_every_token_position_varies() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let secret = stack
            .add("s", |node| LocalSecret::new(node, SecretProps::default()))
            .unwrap();

        let tokens: Vec<Vec<u8>> = (0..200).map(|_| secret.generate().into_bytes()).collect();
        assert!(tokens.iter().all(|t| t.len() == DEFAULT_TOKEN_LENGTH));
        for position in 0..DEFAULT_TOKEN_LENGTH {
            let seen: HashSet<u8> = tokens.iter().map(|t| t[position]).collect();
            assert!(seen.len() > 8, "position {} took {} values", position, seen.len());
        }
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let err = stack
            .add("s", |node| LocalSecret::new(node, SecretProps::with_length(0)))
            .err()
            .unwrap();
        assert!(err.to_string().contains("s: length must be at least 1"));
    }

    #[tokio::test]
    async fn test_dry_run_generates_nothing() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let secret = stack
            .add("s", |node| LocalSecret::new(node, SecretProps::default()))
            .unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        secret.on_change().add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = secret.deploy(true).await.unwrap().settle().await.unwrap();

        assert!(result.changed);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(stack.store().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_set() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let secret = stack
            .add("s", |node| LocalSecret::new(node, SecretProps::default()))
            .unwrap();

        secret.set("chosen").unwrap();
        assert_eq!(secret.value().resolve().await.unwrap(), "chosen");
        assert!(!secret.deploy(false).await.unwrap().settle().await.unwrap().changed);

        secret.clear().unwrap();
        assert!(secret.value().resolve().await.unwrap_err().is_not_available());
    }
}

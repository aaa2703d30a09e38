//! # kiln Core
//!
//! Deferred values, component trees and idempotent deployment.
//!
//! This crate provides:
//! - Deferred values that resolve at most once, in dependency order
//! - Typed component props with schema checks
//! - A durable per-component state store
//! - The orchestrator that deploys a component tree, with dry runs and
//!   partial reports on failure
//!
//! ## Example
//!
//! ```rust,ignore
//! use kiln_core::{KilnConfig, Orchestrator, Stack};
//!
//! let mut stack = Stack::from_config("media", &KilnConfig::from_env())?;
//! let password = stack.add("password", |node| LocalSecret::new(node, SecretProps::default()))?;
//! stack.add("repo", |node| ResticRepository::new(node, props_using(&password), runner))?;
//!
//! let report = Orchestrator::new().apply(&stack.root(), true, false).await?;
//! kiln_core::print_report(&report);
//! ```

pub mod component;
pub mod config;
pub mod error;
pub mod lazy;
pub mod orchestrator;
pub mod props;
pub mod report;
pub mod stack;
pub mod state;
pub mod telemetry;
pub mod upgrade;

pub use component::{
    Callbacks, Component, ComponentPath, Counter, Deploy, DeployResult, Node, Outcome,
};
pub use config::KilnConfig;
pub use error::{KilnError, KilnResult, OperationError};
pub use lazy::{defer, resolve, Deferred, DeferredState, Maybe, Origin};
pub use orchestrator::{AbortOperation, Orchestrator};
pub use props::{references, PropField, PropKind, PropSchema, Props};
pub use report::{
    exit_code, finish_run, print_abort, print_report, DeploymentReport, ExitCodes, ReportEntry,
    ReportFailure, RunMode,
};
pub use stack::{BuildContext, Stack, Subtree};
pub use state::{
    JsonFileBackend, MemoryBackend, StateBackend, StateDocument, StateEntries, StateHandle,
    StateStore,
};
pub use telemetry::init_logging;
pub use upgrade::Upgradable;

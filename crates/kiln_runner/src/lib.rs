//! # kiln_runner
//!
//! External command execution wrapper for kiln.
//!
//! Every side effect a kiln component performs (running `restic`, `terraform`,
//! `docker compose`, an object-store CLI) goes through a [`CommandRunner`].
//! Components hold an `Arc<dyn CommandRunner>` so tests can swap in the
//! [`MockRunner`] without touching real tools.
//!
//! # Features
//!
//! - **Process Runner**: `tokio::process` based execution with captured output
//! - **Checked Commands**: non-zero exit codes become [`RunnerError::CommandFailed`]
//!   carrying the captured output
//! - **Mock Runner**: scripted responses and call capture for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_runner::{CommandRunner, CommandSpec, ProcessRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = ProcessRunner::new();
//!
//!     let spec = CommandSpec::new("restic")
//!         .args(["list", "index"])
//!         .env("RESTIC_REPOSITORY", "/srv/backups");
//!
//!     let output = runner.run(&spec).await?;
//!     println!("Exit code: {}", output.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod error;
pub mod mock;
pub mod process;
pub mod runner;

pub use command::{CommandOutput, CommandSpec};
pub use error::{RunnerError, RunnerResult};
pub use mock::{CapturedCall, MockResponse, MockRunner};
pub use process::ProcessRunner;
pub use runner::CommandRunner;

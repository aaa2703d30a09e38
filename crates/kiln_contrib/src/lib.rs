//! # kiln Contrib
//!
//! Components built on kiln_core:
//!
//! - [`LocalSecret`]: a random token generated on first deploy
//! - [`ResticRepository`]: a restic repository initialized on first deploy
//! - [`ResticBackup`]: a repository with a generated password
//! - [`Version`]: a persisted version pin, optionally following GitHub releases

pub mod backup;
pub mod restic;
pub mod secret;
pub mod version;

pub use backup::{BackupProps, ResticBackup};
pub use restic::{ResticProps, ResticRepository, MISSING_REPOSITORY_MARKER};
pub use secret::{LocalSecret, SecretProps};
pub use version::{GithubReleases, Version, VersionChange, VersionProps, VersionSource};

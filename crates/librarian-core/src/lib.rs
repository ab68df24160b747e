//! Core library for librarian.
//!
//! Librarian keeps a repository of generated client libraries in step with
//! the API definitions they are generated from, and releases them. This
//! crate holds everything except the command-line surface.
//!
//! # Modules
//!
//! - [`commit`] - Conventional commit parsing
//! - [`config`] - Tool configuration loading
//! - [`container`] - Language generator containers
//! - [`context`] - Per-invocation context
//! - [`error`] - Configuration error types
//! - [`fetch`] - Upstream source download and cache
//! - [`forge`] - Pull requests, reviews and releases
//! - [`generate`] - Generate, configure and update-apis workflows
//! - [`git`] - Local git operations
//! - [`language`] - Per-language strategy
//! - [`release`] - Release workflows
//! - [`secrets`] - Credential lookup
//! - [`state`] - Repository state and configuration documents
//! - [`version`] - Version bumps
//!
//! # Quick Start
//!
//! ```no_run
//! use camino::Utf8Path;
//! use librarian_core::{ConfigLoader, LibrarianState};
//!
//! let config = ConfigLoader::new()
//!     .with_user_config(true)
//!     .load()
//!     .expect("Failed to load configuration");
//! let state = LibrarianState::load(Utf8Path::new(".")).expect("no state");
//!
//! println!("image {} ({:?})", state.image, config.log_level);
//! ```
#![deny(unsafe_code)]

pub mod commit;

pub mod config;

pub mod container;

pub mod context;

pub mod error;

pub mod fetch;

pub mod forge;

pub mod generate;

pub mod git;

pub mod language;

pub mod release;

pub mod secrets;

pub mod state;

pub mod version;

pub use config::{Config, ConfigLoader, LogLevel};

pub use context::RunContext;

pub use error::{ConfigError, ConfigResult};

pub use language::Language;

pub use state::{LibrarianState, LibraryState, RepoConfig};

// Re-export semver so downstream crates don't need a direct dependency.
pub use semver;

//! Concurrent build driver for a curated package ecosystem: given a
//! resolved build plan, compiles every package exactly once in
//! dependency order, produces an installed binary database and HTML
//! documentation tree, and reports a structured summary of successes,
//! failures, and warnings.
//!
//! The crate never initialises a global `tracing` subscriber; install
//! one (e.g. `tracing_subscriber::fmt`) before calling [`perform_build`]
//! if you want its spans and events surfaced.

mod config;
mod driver;
mod error;
mod gate;
mod governor;
mod haddock;
mod ledger;
mod package;
mod package_db;
mod plan;
mod toolchain;

pub use config::{BuildConfig, DbMode, ToolMissingPolicy};
pub use driver::perform_build;
pub use error::{BuildError, BuildException, Result};
pub use plan::{BuildPlan, Component, Dependency, PackageConstraints, PackagePlan, TestState};
pub use toolchain::{Toolchain, ToolchainAdapter};

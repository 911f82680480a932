//! Core build-orchestration engine for a `redo`-style build system.
//!
//! This crate implements the three tightly coupled subsystems that do the
//! hard work of such a system: the [`token`] jobserver-compatible
//! concurrency limiter, the [`resolver`]/[`recipe`] pair that locates and
//! invokes a target's recipe, the [`job`] per-target state machine, and
//! the [`orchestrator`] that drives a whole target list through them.
//!
//! The persistent dependency database, the recipe interpreter (a plain
//! shell), and the `redo-unlocked` helper are external collaborators,
//! described only through the traits in [`collab`]. This crate never
//! initializes a logger; it emits through the [`log`] facade and leaves
//! the choice of sink to the embedding application.

#![cfg(unix)]

pub mod collab;
pub mod config;
pub mod cycle;
pub mod error;
pub mod job;
pub mod recipe;
pub mod resolver;
pub mod token;

mod orchestrator;

pub use collab::{DepKind, File, FileId, Lock, ShouldBuild, State, STAMP_MISSING};
pub use config::Config;
pub use cycle::CycleRegistry;
pub use error::{aggregate, CoreError, ExitCode, InvariantViolation};
pub use job::{BuildJob, DoneFn};
pub use orchestrator::run as run_targets;
pub use token::JobController;

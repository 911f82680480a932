//! Run-wide configuration.
//!
//! This crate does not parse CLI flags or config files;
//! the embedding application is expected to build one `Config` and pass
//! it by reference into the [`crate::orchestrator::Orchestrator`] and
//! [`crate::job::BuildJob`].

use std::path::PathBuf;

/// Run-wide configuration flags and path context.
#[derive(Debug, Clone)]
pub struct Config {
    /// Randomize top-level target order. Deterministic when
    /// `shuffle_seed` is set, so runs stay reproducible in tests.
    pub shuffle: bool,
    /// Seed used for the shuffle RNG when `shuffle` is set. `None` means
    /// "seed from entropy" (only meaningful outside tests).
    pub shuffle_seed: Option<u64>,
    /// Continue building sibling top-level targets after one fails.
    pub keep_going: bool,
    /// Treat all locks as already owned (single-process mode). This crate
    /// takes no lock-bypassing action on this flag itself: the embedding
    /// application is expected to read it when choosing which `Lock`
    /// collaborator to construct (a real advisory-locking one, or a
    /// trivial always-owned one for a single-process run), since locking
    /// policy belongs to the collaborator (`spec.md` §1, §6), not this
    /// orchestrator. Carried here so the application has one place to
    /// read every enumerated run flag from.
    pub unlocked: bool,
    /// Emit locking trace messages (via `log::trace!`).
    pub debug_locks: bool,
    /// Force in-process build even when freshness is ambiguous, skipping
    /// `redo-unlocked`.
    pub no_unlocked: bool,
    /// Append `v` to the recipe's `sh` flags.
    pub verbose: bool,
    /// Append `x` to the recipe's `sh` flags.
    pub xtrace: bool,
    /// Project root all target paths are relative to.
    pub base: PathBuf,
    /// Directory the user invoked the build from.
    pub startdir: PathBuf,
    /// Nesting depth of the current build process, used to compute
    /// `REDO_DEPTH` for children.
    pub depth: String,
}

impl Config {
    /// A config with every flag at its conservative default: no shuffle,
    /// stop on first failure, real locking, no forced rebuilds.
    pub fn new(base: PathBuf, startdir: PathBuf) -> Self {
        Config {
            shuffle: false,
            shuffle_seed: None,
            keep_going: false,
            unlocked: false,
            debug_locks: false,
            no_unlocked: false,
            verbose: false,
            xtrace: false,
            base,
            startdir,
            depth: String::new(),
        }
    }

    /// The `sh` flag suffix for a recipe invocation: `-e`, optionally
    /// followed by `v` and/or `x`.
    pub fn sh_flags(&self) -> String {
        let mut flags = String::from("-e");
        if self.verbose {
            flags.push('v');
        }
        if self.xtrace {
            flags.push('x');
        }
        flags
    }

    /// `REDO_DEPTH` for a child process one level deeper than us.
    pub fn child_depth(&self) -> String {
        format!("{}  ", self.depth)
    }
}

//! Error types for the core build engine.
//!
//! Most build outcomes are *not* represented as `Err` here: a recipe that
//! fails, a missing rule, or a dependency cycle are modeled results of a
//! build and surface as one of the exit codes
//! (see [`crate::ExitCode`]). `CoreError` is reserved for conditions the
//! caller cannot recover from by inspecting an exit code: I/O failures
//! talking to the OS, a collaborator (database/lock) erroring out, or one
//! of the fatal invariant violations below.

use std::fmt;
use std::io;

use thiserror::Error;

/// Top-level error type returned by fallible operations in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O operation (pipe, fork, exec, rename, ...) failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A collaborator (dependency database, lock, recipe runner) reported
    /// an error of its own. Boxed because this crate does not own the
    /// collaborator's error type.
    #[error("collaborator error: {0}")]
    Collaborator(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// One of the core invariants was violated. These are
    /// unrecoverable: the process that observes one must exit.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl CoreError {
    /// Wrap an arbitrary collaborator error.
    pub fn collaborator<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CoreError::Collaborator(Box::new(err))
    }
}

/// A fatal, unrecoverable invariant violation. These never get a
/// sibling-build-continues treatment;
/// the process that observes one is expected to abort.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    /// Read of the jobserver pipe hit EOF: some other participant closed
    /// its write end while tokens were still owed to us.
    #[error("jobserver pipe closed unexpectedly (token EOF)")]
    TokenPipeEof,

    /// `wait_all` could not balance the token count against `T-1` tokens
    /// on toplevel completion.
    #[error("token accounting mismatch: expected {expected} tokens in pool, found {found}")]
    TokenCountMismatch { expected: usize, found: usize },

    /// A `waitpid` on a completion fd reaped a pid this controller did not
    /// record as outstanding.
    #[error("reaped unknown child pid {0}")]
    UnknownChild(i32),

    /// select/poll reported a completion fd ready that has no
    /// corresponding entry in the running-job table.
    #[error("unknown completion fd became readable")]
    UnknownCompletionFd,
}

/// The process-level exit codes a build run can produce.
///
/// Unlike [`CoreError`], these are ordinary (non-exceptional) results: a
/// [`crate::job::BuildJob`] or [`crate::orchestrator::Orchestrator`] run
/// returns one of these as data, never as an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    NoRule = 1,
    FailedElsewhere = 2,
    RecipePanic = 201,
    StateDirMissing = 205,
    ModifiedDirectly = 206,
    DualOutputChannel = 207,
    InstallFailed = 208,
    DependencyCycle = 209,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ExitCode::Success => "success",
            ExitCode::NoRule => "no rule to make target",
            ExitCode::FailedElsewhere => "failed in another build thread",
            ExitCode::RecipePanic => "recipe subprocess raised an uncaught exception",
            ExitCode::StateDirMissing => "state directory disappeared",
            ExitCode::ModifiedDirectly => "target modified directly by its recipe",
            ExitCode::DualOutputChannel => "recipe wrote both stdout and $3",
            ExitCode::InstallFailed => "rename/remove failed while installing output",
            ExitCode::DependencyCycle => "dependency cycle detected",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

/// Combine two per-target outcomes into an aggregate run retcode: the OR
/// of per-target outcomes.
pub fn aggregate(a: i32, b: i32) -> i32 {
    if a != 0 {
        a
    } else {
        b
    }
}

//! Collaborator interfaces.
//!
//! The persistent dependency/stamp database, the recipe interpreter, and
//! `redo-unlocked` are explicitly out of scope for this crate. This module
//! only defines the traits the core drives them through; it ships no
//! production implementation. A minimal in-memory double used by this
//! crate's own tests lives under `tests/support/`.

use std::error::Error as StdError;
use std::path::Path;

/// Opaque identifier for a target, assigned by the database on first
/// mention.
pub type FileId = u64;

/// Sentinel stamp value meaning "this file does not exist on disk".
pub const STAMP_MISSING: u64 = 0;

/// Result of a freshness check, modeling an exception-typed short-circuit
/// as a plain sum type.
#[derive(Debug)]
pub enum ShouldBuild {
    /// The target is up to date; skip straight to `release` with rv 0.
    Clean,
    /// An immediate, authoritative result — skip straight to `release`
    /// with this return code.
    ImmediateReturn(i32),
    /// Unconditionally dirty (or `Config::no_unlocked` is set): go
    /// straight to `prepare_do` without consulting `redo-unlocked`.
    Dirty,
    /// A list of suspect dependency names that `redo-unlocked` should be
    /// asked to confirm or deny out of band.
    Suspects(Vec<String>),
}

/// Dependency edge kind recorded by [`File::add_dep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// The recipe candidate that was selected (`m`-edge).
    Match,
    /// A recipe candidate that was probed and did not exist (`c`-edge).
    CandidateMiss,
}

/// A single target's persistent record.
///
/// Implementations own storage; this crate only reads/writes through the
/// trait so the stamp/schema format stays entirely up to the collaborator.
pub trait File {
    /// Stable id assigned by the database.
    fn id(&self) -> FileId;

    /// Path relative to BASE.
    fn name(&self) -> &str;

    fn is_generated(&self) -> bool;
    fn is_override(&self) -> bool;
    fn is_static(&self) -> bool;
    fn is_checked(&self) -> bool;
    fn is_changed(&self) -> bool;
    fn is_failed(&self) -> bool;

    fn set_generated(&mut self, v: bool);
    fn set_override(&mut self, v: bool);
    fn set_static(&mut self, v: bool);
    fn set_checked(&mut self, v: bool);
    fn set_changed(&mut self, v: bool);
    fn set_failed(&mut self, v: bool);

    /// Opaque on-disk summary (size+mtime+mode or equivalent), or
    /// [`STAMP_MISSING`].
    fn stamp(&self) -> u64;
    fn set_stamp(&mut self, stamp: u64);

    /// Optional content checksum used by `redo-stamp`.
    fn csum(&self) -> Option<&str>;
    fn clear_csum(&mut self);

    /// Record a dependency edge of the given kind on `path`.
    fn add_dep(&mut self, kind: DepKind, path: &str);

    /// Reset first-generation dependency edges (before the recipe runs).
    fn zap_deps1(&mut self);
    /// Reset second-generation dependency edges (after the recipe runs).
    fn zap_deps2(&mut self);

    /// Re-read this record's fields from the stamp database.
    fn refresh(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>>;
    /// Flush this record's fields to the stamp database.
    fn save(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>>;

    /// Read the on-disk stamp for this target's path, without touching
    /// the persisted record.
    fn read_stamp(&self, base: &Path) -> u64;
    /// Recompute and store the stamp from the current on-disk state.
    fn update_stamp(&mut self, base: &Path);
}

/// A per-target advisory lock.
///
/// Two processes must never hold the same lock simultaneously; this is
/// the mechanism enforcing the at-most-one-build invariant.
pub trait Lock {
    /// Attempt to acquire without blocking. Returns whether it is now
    /// owned by us.
    fn trylock(&mut self) -> Result<bool, Box<dyn StdError + Send + Sync>>;
    /// Block until acquired.
    fn waitlock(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>>;
    /// Release. No-op if not owned.
    fn unlock(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>>;
    /// Whether this process currently owns the lock.
    fn owned(&self) -> bool;
}

/// The database/session-wide collaborator.
pub trait State {
    type F: File;
    type L: Lock;

    /// Look up or lazily create the file record for `path`.
    fn file(&mut self, path: &str) -> Result<Self::F, Box<dyn StdError + Send + Sync>>;
    /// Look up the file record for an already-known id.
    fn file_by_id(&mut self, id: FileId) -> Result<Self::F, Box<dyn StdError + Send + Sync>>;
    /// Obtain this target's lock.
    fn lock(&mut self, id: FileId) -> Self::L;

    /// Flush all pending database changes.
    fn commit(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>>;
    /// Verify the collaborator's state directory still exists.
    fn check_sane(&self) -> bool;
    /// Warn that `name` was modified outside the build (user override).
    fn warn_override(&self, name: &str);
}

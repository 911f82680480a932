//! The Build Job state machine.
//!
//! A [`BuildJob`] owns exactly one (target, file record, lock) triple for
//! its entire lifetime: constructed once the lock is held, it runs through
//! freshness check, recipe resolution, forked recipe execution and atomic
//! install, and always ends by invoking its caller's `donefunc` and
//! releasing the lock — on every path, including the early-exit ones.

use std::env;
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd;

use crate::collab::{DepKind, File, Lock, ShouldBuild};
use crate::config::Config;
use crate::cycle::CycleRegistry;
use crate::error::{CoreError, ExitCode};
use crate::recipe::{self, build_argv};
use crate::resolver;
use crate::token::JobController;

/// A callback invoked once a [`BuildJob`] reaches a terminal state, with
/// the target name and its final return code.
pub type DoneFn = Box<dyn FnOnce(&str, i32)>;

/// Per-target state machine. Generic over the
/// collaborator's concrete `File`/`Lock` types so this crate never
/// depends on a particular stamp-database implementation.
pub struct BuildJob<F: File, L: Lock> {
    target: String,
    file: F,
    lock: L,
}

impl<F: File + 'static, L: Lock + 'static> BuildJob<F, L> {
    /// Construct a job for `target`. Precondition: `lock.owned()` is
    /// already `true` — the Orchestrator must have acquired it before
    /// handing the triple off.
    pub fn new(target: impl Into<String>, file: F, lock: L) -> Self {
        debug_assert!(lock.owned(), "BuildJob constructed without an owned lock");
        BuildJob {
            target: target.into(),
            file,
            lock,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Drive this job to completion. `shouldbuild` decides the freshness
    /// outcome; `warn_override` is the collaborator's
    /// `state.warn_override(name)` hook, invoked only on the user-override
    /// path in `prepare_do`; `donefunc` is always invoked exactly
    /// once, synchronously for the terminal `init` outcomes and
    /// asynchronously (from within a later [`JobController::wait_all`]
    /// call) once a forked recipe or `redo-unlocked` check completes.
    pub fn start(
        self,
        config: &Config,
        jobs: &mut JobController,
        cycles: &Arc<CycleRegistry>,
        shouldbuild: impl FnOnce(&str) -> ShouldBuild,
        warn_override: &dyn Fn(&str),
        donefunc: DoneFn,
    ) -> Result<(), CoreError> {
        match shouldbuild(&self.target) {
            ShouldBuild::Clean => self.release(0, donefunc),
            ShouldBuild::ImmediateReturn(rv) => self.release(rv, donefunc),
            ShouldBuild::Dirty => self.prepare_do(config, jobs, cycles, warn_override, donefunc),
            ShouldBuild::Suspects(suspects) => {
                if config.no_unlocked {
                    self.prepare_do(config, jobs, cycles, warn_override, donefunc)
                } else {
                    self.unlocked_check(jobs, cycles, suspects, donefunc)
                }
            }
        }
    }

    /// Fork a child that `exec`s `redo-unlocked <target> <suspects...>`,
    /// holding our lock for the duration. Its exit code becomes the job's
    /// final rv with no further
    /// in-process bookkeeping.
    fn unlocked_check(
        self,
        jobs: &mut JobController,
        cycles: &Arc<CycleRegistry>,
        suspects: Vec<String>,
        donefunc: DoneFn,
    ) -> Result<(), CoreError> {
        let cycle_guard = cycles.enter_owned(&self.target);
        let target = self.target.clone();
        let start_reason = self.target.clone();

        let jobfunc = move || {
            let mut argv = vec!["redo-unlocked".to_string(), target];
            argv.extend(suspects);
            exec_argv(&argv)
        };

        let after_job = move |_name: &str, rv: i32| {
            drop(cycle_guard);
            if let Err(e) = self.release(rv, donefunc) {
                log::error!("release after unlocked_check failed: {e}");
            }
        };

        unsafe { jobs.start_job(&start_reason, jobfunc, after_job) }
    }

    /// User-override/static-source detection, recipe resolution, temp
    /// file setup and the fork into the recipe.
    fn prepare_do(
        mut self,
        config: &Config,
        jobs: &mut JobController,
        cycles: &Arc<CycleRegistry>,
        warn_override: &dyn Fn(&str),
        donefunc: DoneFn,
    ) -> Result<(), CoreError> {
        let target_path = PathBuf::from(&self.target);
        let full_path = config.base.join(&target_path);

        // Step 1: a generated file whose on-disk stamp no longer matches
        // the recorded one was edited by hand between builds.
        if self.file.is_generated() {
            let disk_stamp = self.file.read_stamp(&config.base);
            if disk_stamp != self.file.stamp() {
                self.file.set_override(true);
                self.file.set_checked(true);
                self.file.save().map_err(CoreError::collaborator)?;
                warn_override(&self.target);
                return self.release(0, donefunc);
            }
        }

        // Step 2: an ungenerated file that already exists is a static
        // source, never a build product.
        let meta = fs::symlink_metadata(&full_path);
        if let Ok(m) = &meta {
            if !self.file.is_generated() && !m.is_dir() {
                self.file.set_static(true);
                self.file.save().map_err(CoreError::collaborator)?;
                return self.release(0, donefunc);
            }
        }

        // Step 3
        self.file.zap_deps1();

        // Step 4: resolve a recipe, recording every probed candidate.
        let resolution = resolver::resolve(&config.base, &target_path);
        for (found, path) in resolution.dep_edges() {
            let rel = path.strip_prefix(&config.base).unwrap_or(path);
            let kind = if found { DepKind::Match } else { DepKind::CandidateMiss };
            self.file.add_dep(kind, &rel.to_string_lossy());
        }

        let recipe = match resolution.recipe {
            Some(r) => r,
            None => {
                if meta.is_ok() {
                    self.file.set_static(true);
                    self.file.save().map_err(CoreError::collaborator)?;
                    return self.release(0, donefunc);
                }
                log::error!("no rule to make '{}'", self.target);
                return self.release(ExitCode::NoRule.code(), donefunc);
            }
        };

        // Step 5: temp files.
        let temps = recipe::temp_paths(&config.base, &target_path);
        let _ = fs::remove_file(&temps.tmp1);
        let _ = fs::remove_file(&temps.tmp2);

        let tmp1_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&temps.tmp1)?;
        set_cloexec(tmp1_file.as_raw_fd(), true)?;
        // If anything between here and the fork below bails out with `?`,
        // don't leave tmp1 behind on disk.
        let tmp1_cleanup = scopeguard::guard(temps.tmp1.clone(), |path| {
            let _ = fs::remove_file(path);
        });

        // Step 6: argv, with shebang rewriting handled by `recipe`.
        let recipe_path = recipe.recipe_dir.join(&recipe.recipe_file);
        let arg1 = format!("{}{}", recipe.base_name, recipe.ext);
        let arg2 = recipe.base_name.clone();
        let invocation = build_argv(&recipe_path, &config.sh_flags(), &arg1, &arg2, &temps.tmp2_rel)?;

        // Step 7: this target is now (again) a build product; the recipe
        // file itself is a static dependency.
        self.file.set_generated(true);
        self.file.save().map_err(CoreError::collaborator)?;
        let recipe_rel = recipe_path
            .strip_prefix(&config.base)
            .unwrap_or(&recipe_path)
            .to_string_lossy()
            .into_owned();
        self.file.add_dep(DepKind::Match, &recipe_rel);

        // Step 8: fork via the Job Controller.
        let old_stamp = self.file.stamp();
        let cycle_guard = cycles.enter_owned(&self.target);
        let start_reason = self.target.clone();

        let redo_target = arg1.clone();
        let redo_pwd = relative_to(&config.startdir, &recipe.recipe_dir);
        let redo_depth = config.child_depth();
        let recipe_dir = recipe.recipe_dir.clone();
        let tmp1_fd = tmp1_file.as_raw_fd();
        let argv = invocation.argv.clone();

        let jobfunc = move || do_subproc(&recipe_dir, &redo_target, &redo_pwd, &redo_depth, tmp1_fd, &argv);

        // Past this point tmp1's lifetime is owned by the after-completion
        // cleanup in `after1`/`after_job`, not this early-return guard.
        scopeguard::ScopeGuard::into_inner(tmp1_cleanup);

        let base = config.base.clone();
        let tmp1_path = temps.tmp1.clone();
        let tmp2_path = temps.tmp2.clone();

        let after_job = move |_name: &str, spawn_rv: i32| {
            drop(cycle_guard);
            drop(tmp1_file); // parent's copy; the child's dup2'd stdout is what mattered.
            let rv = match after1(&base, &full_path, &tmp1_path, &tmp2_path, &mut self.file, old_stamp, spawn_rv) {
                Ok(rv) => rv,
                Err(e) => {
                    log::error!("after1 failed for '{}': {}", self.target, e);
                    ExitCode::InstallFailed.code()
                }
            };
            if let Err(e) = self.release(rv, donefunc) {
                log::error!("release after prepare_do failed: {e}");
            }
        };

        unsafe { jobs.start_job(&start_reason, jobfunc, after_job) }
    }

    /// Always invoked exactly once, from every terminal path.
    fn release(mut self, rv: i32, donefunc: DoneFn) -> Result<(), CoreError> {
        donefunc(&self.target, rv);
        self.lock.unlock().map_err(CoreError::collaborator)
    }
}

/// Runs in the parent after the recipe child has
/// been reaped. Discriminates the two output channels, commits the
/// result, and refreshes the file record's stamp.
fn after1(
    base: &Path,
    target_full: &Path,
    tmp1: &Path,
    tmp2: &Path,
    file: &mut impl File,
    old_stamp: u64,
    spawn_rv: i32,
) -> Result<i32, CoreError> {
    let target_meta = fs::symlink_metadata(target_full);
    let target_exists = target_meta.is_ok();
    let target_is_dir = target_meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);

    let mut rv = spawn_rv;

    // Step 1: did the recipe modify the target file in place, instead of
    // going through tmp1/tmp2? Compare against the stamp recorded *before*
    // this run started.
    let current_stamp = file.read_stamp(base);
    if target_exists && !target_is_dir && current_stamp != old_stamp {
        log::error!("target '{}' was modified directly by its recipe", file.name());
        rv = ExitCode::ModifiedDirectly.code();
    } else {
        let tmp2_exists = tmp2.exists();
        let tmp1_len = fs::metadata(tmp1).map(|m| m.len()).unwrap_or(0);

        if tmp2_exists && tmp1_len > 0 {
            log::error!("target '{}' wrote both stdout and $3", file.name());
            rv = ExitCode::DualOutputChannel.code();
        } else if let Err(e) = commit_output(target_full, tmp1, tmp2, tmp2_exists, tmp1_len) {
            log::error!("install failed for '{}': {}", file.name(), e);
            rv = ExitCode::InstallFailed.code();
        }
    }

    // Step 4: pick up whatever an in-run `redo-stamp` process wrote to
    // this file's record while our recipe subprocess was running — our
    // copy was loaded before the fork, so it can only see that update by
    // re-reading it now. Keep the recorded stamp if it is already
    // checked/changed; otherwise refresh the stamp from disk ourselves.
    file.refresh().map_err(CoreError::collaborator)?;
    if !(file.is_checked() || file.is_changed()) {
        file.clear_csum();
        file.update_stamp(base);
        file.set_changed(true);
    }

    // Step 5
    if rv != 0 {
        let _ = fs::remove_file(tmp1);
        let _ = fs::remove_file(tmp2);
        file.set_failed(true);
    }

    // Step 6
    file.zap_deps2();
    if let Err(e) = file.save() {
        log::error!("failed to save file record for '{}': {}", file.name(), e);
    }
    Ok(rv)
}

/// Atomically install whichever channel
/// produced output, or remove the target if neither did.
fn commit_output(target: &Path, tmp1: &Path, tmp2: &Path, tmp2_exists: bool, tmp1_len: u64) -> io::Result<()> {
    if tmp2_exists {
        fs::rename(tmp2, target)?;
        let _ = fs::remove_file(tmp1);
        Ok(())
    } else if tmp1_len > 0 {
        fs::rename(tmp1, target)
    } else {
        let _ = fs::remove_file(tmp1);
        remove_no_output_target(target)
    }
}

/// Neither channel produced output: remove any existing target, but
/// refuse to blow away a non-empty directory sitting at the target path.
fn remove_no_output_target(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(m) if m.is_dir() => match fs::read_dir(target) {
            Ok(mut entries) if entries.next().is_none() => fs::remove_dir(target),
            Ok(_) => {
                log::warn!("refusing to remove non-empty directory at target path {:?}", target);
                Ok(())
            }
            Err(e) => Err(e),
        },
        Ok(_) => fs::remove_file(target),
    }
}

/// Runs in the forked child, between `fork`
/// and `execvp`. Any return from `execvp` is fatal, reported as rv 127
/// (matching conventional shell "command not found" semantics) since the
/// parent treats this closure's return value as the child's exit code.
fn do_subproc(recipe_dir: &Path, redo_target: &str, redo_pwd: &str, redo_depth: &str, tmp1_fd: RawFd, argv: &[String]) -> i32 {
    env::set_var("REDO_PWD", redo_pwd);
    env::set_var("REDO_TARGET", redo_target);
    env::set_var("REDO_DEPTH", redo_depth);

    if let Err(e) = unistd::chdir(recipe_dir) {
        log::error!("chdir to {:?} failed: {}", recipe_dir, e);
        return 1;
    }
    if let Err(e) = unistd::dup2(tmp1_fd, libc::STDOUT_FILENO) {
        log::error!("dup2 onto stdout failed: {}", e);
        return 1;
    }
    if let Err(e) = fcntl(libc::STDOUT_FILENO, FcntlArg::F_SETFD(FdFlag::empty())) {
        log::error!("clearing close-on-exec on stdout failed: {}", e);
        return 1;
    }

    exec_argv(argv)
}

/// `execvp` the given argv, returning 127 if it could not even start
/// (never returns on success).
fn exec_argv(argv: &[String]) -> i32 {
    let cargs: Result<Vec<CString>, _> = argv.iter().map(|a| CString::new(a.as_str())).collect();
    let cargs = match cargs {
        Ok(v) => v,
        Err(e) => {
            log::error!("argv contains an embedded NUL: {}", e);
            return 127;
        }
    };
    match unistd::execvp(&cargs[0], &cargs) {
        Ok(never) => match never {},
        Err(e) => {
            log::error!("execvp({:?}) failed: {}", cargs[0], e);
            127
        }
    }
}

fn set_cloexec(fd: RawFd, set: bool) -> io::Result<()> {
    let flag = if set { FdFlag::FD_CLOEXEC } else { FdFlag::empty() };
    fcntl(fd, FcntlArg::F_SETFD(flag)).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// `to`'s path relative to `from`, computed purely lexically (both are
/// expected to already be absolute and `.`-free, as `base`-joined paths
/// are throughout this crate).
fn relative_to(from: &Path, to: &Path) -> String {
    let from_comps: Vec<_> = from.components().collect();
    let to_comps: Vec<_> = to.components().collect();

    let common = from_comps
        .iter()
        .zip(to_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..from_comps.len() {
        result.push("..");
    }
    for comp in &to_comps[common..] {
        result.push(comp.as_os_str());
    }

    if result.as_os_str().is_empty() {
        ".".to_string()
    } else {
        result.to_string_lossy().into_owned()
    }
}

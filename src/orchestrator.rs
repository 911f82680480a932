//! The Build Orchestrator: drives a list of top-level
//! targets through an optimistic phase and a blocking phase, detecting
//! cycles and aggregating the run's exit code.

use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::collab::{ShouldBuild, State};
use crate::config::Config;
use crate::cycle::CycleRegistry;
use crate::error::{self, CoreError, ExitCode};
use crate::job::BuildJob;
use crate::token::JobController;

/// Drive `targets` to completion against `state`, using `jobs` for
/// concurrency and `shouldbuild` to decide each target's freshness.
/// Returns the aggregate exit code (the OR of per-target outcomes).
pub fn run<S>(
    state: &mut S,
    config: &Config,
    jobs: &mut JobController,
    targets: &[String],
    shouldbuild: &dyn Fn(&str) -> ShouldBuild,
) -> Result<i32, CoreError>
where
    S: State,
    S::F: 'static,
    S::L: 'static,
{
    run_with_cycles(state, config, jobs, targets, shouldbuild, Arc::new(CycleRegistry::new()))
}

/// Same as [`run`], but takes the cycle registry instead of creating one,
/// so a test can pre-populate it and exercise phase 2's cycle-detection
/// branch directly.
fn run_with_cycles<S>(
    state: &mut S,
    config: &Config,
    jobs: &mut JobController,
    targets: &[String],
    shouldbuild: &dyn Fn(&str) -> ShouldBuild,
    cycles: Arc<CycleRegistry>,
) -> Result<i32, CoreError>
where
    S: State,
    S::F: 'static,
    S::L: 'static,
{
    let retcode = Rc::new(Cell::new(0i32));

    let order = ordered_targets(targets, config);
    let mut deferred: VecDeque<(u64, String)> = VecDeque::new();
    let mut seen = HashSet::new();

    // Phase 1 — optimistic.
    for target in order {
        if !seen.insert(target.clone()) {
            continue;
        }

        jobs.get_token("orchestrator baseline")?;
        state.commit().map_err(CoreError::collaborator)?;

        if retcode.get() != 0 && !config.keep_going {
            break;
        }

        if !state.check_sane() {
            retcode.set(error::aggregate(retcode.get(), ExitCode::StateDirMissing.code()));
            break;
        }

        let file = state.file(&target).map_err(CoreError::collaborator)?;
        let file_id = file.id();
        let mut lock = state.lock(file_id);

        if lock.trylock().map_err(CoreError::collaborator)? {
            if config.debug_locks {
                log::trace!("lock: acquired '{}' on first try (phase 1)", target);
            }
            let job = BuildJob::new(target.clone(), file, lock);
            let donefunc = make_donefunc(&retcode);
            let warn_override = |name: &str| state.warn_override(name);
            job.start(config, jobs, &cycles, |t| shouldbuild(t), &warn_override, donefunc)?;
        } else {
            if config.debug_locks {
                log::trace!("lock: '{}' busy, deferring to phase 2", target);
            }
            deferred.push_back((file_id, target));
        }
    }

    // Phase 2 — blocking.
    while !deferred.is_empty() || jobs.has_running() {
        state.commit().map_err(CoreError::collaborator)?;
        jobs.wait_all()?;

        if retcode.get() != 0 && !config.keep_going {
            break;
        }

        let Some((file_id, target)) = deferred.pop_front() else {
            continue;
        };

        if cycles.contains(&target) {
            log::error!("dependency cycle detected at target '{}'", target);
            retcode.set(error::aggregate(retcode.get(), ExitCode::DependencyCycle.code()));
            continue;
        }

        let mut file = state.file_by_id(file_id).map_err(CoreError::collaborator)?;
        let mut lock = state.lock(file_id);

        loop {
            if lock.trylock().map_err(CoreError::collaborator)? {
                if config.debug_locks {
                    log::trace!("lock: acquired '{}' in phase 2", target);
                }
                break;
            }
            // Never call get_token while holding a lock: surrender ours,
            // wait for the lock to free up, release it again immediately,
            // then reacquire a token before racing for it once more.
            if config.debug_locks {
                log::trace!("lock: surrendering token to wait on '{}'", target);
            }
            jobs.put_token()?;
            lock.waitlock().map_err(CoreError::collaborator)?;
            lock.unlock().map_err(CoreError::collaborator)?;
            jobs.get_token("phase2 reacquire")?;
        }

        if file.is_failed() {
            log::warn!("target '{}' already marked failed, not rebuilding", target);
            retcode.set(error::aggregate(retcode.get(), ExitCode::FailedElsewhere.code()));
            let _ = lock.unlock();
        } else {
            let job = BuildJob::new(target, file, lock);
            let donefunc = make_donefunc(&retcode);
            let warn_override = |name: &str| state.warn_override(name);
            job.start(config, jobs, &cycles, |t| shouldbuild(t), &warn_override, donefunc)?;
        }
    }

    state.commit().map_err(CoreError::collaborator)?;
    Ok(retcode.get())
}

fn make_donefunc(retcode: &Rc<Cell<i32>>) -> Box<dyn FnOnce(&str, i32)> {
    let retcode = retcode.clone();
    Box::new(move |name, rv| {
        if rv != 0 {
            log::debug!("target '{}' finished with rv={}", name, rv);
        }
        retcode.set(error::aggregate(retcode.get(), rv));
    })
}

fn ordered_targets(targets: &[String], config: &Config) -> Vec<String> {
    let mut order = targets.to_vec();
    if config.shuffle {
        let mut rng = match config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        order.shuffle(&mut rng);
    }
    order
}

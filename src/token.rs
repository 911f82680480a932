//! A GNU-make-jobserver-compatible, token-rationed parallel executor.
//!
//! Built on the usual pipe-management idioms (close-on-exec pipe creation,
//! `poll`-based readiness, `FIONREAD` token counting) but reshaped around
//! a process-per-job model: instead of handing out an RAII `Acquired`
//! token to a thread, `start_job` forks a child that runs a caller-supplied
//! closure and reports its exit status back through a dedicated completion
//! pipe, and `wait_all` drains every outstanding child before returning.

use std::collections::HashMap;
use std::env;
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, alarm, ForkResult, Pid};

use crate::error::{CoreError, InvariantViolation};

/// Env var GNU make (and this controller, when acting as the top-level
/// jobserver) publishes the shared pipe's fds through.
const MAKEFLAGS: &str = "MAKEFLAGS";

fn io_err(e: Errno) -> CoreError {
    CoreError::Io(std::io::Error::from_raw_os_error(e as i32))
}

/// Bookkeeping for one outstanding recipe subprocess.
struct Completion {
    name: String,
    pid: Pid,
    donefunc: Box<dyn FnOnce(&str, i32)>,
}

/// The token-rationed, fork-based job executor.
///
/// Not `Send`/`Sync` by design: one controller per single-threaded OS
/// process, threaded explicitly through the call graph rather than shared
/// across threads.
pub struct JobController {
    read: OwnedFd,
    write: OwnedFd,
    /// `true` if we created this pipe (and therefore know its true
    /// size and can perform the end-of-run conservation check);
    /// `false` if we adopted one from `MAKEFLAGS` during setup.
    pool_size: Option<usize>,
    has_token: bool,
    running: HashMap<RawFd, Completion>,
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("pool_size", &self.pool_size)
            .field("has_token", &self.has_token)
            .field("running", &self.running.len())
            .finish()
    }
}

impl JobController {
    /// Idempotent setup. Adopts an inherited
    /// jobserver pipe from `MAKEFLAGS=--jobserver-fds=R,W` if present and
    /// valid; otherwise, if `maxjobs > 0`, creates a new pipe seeded with
    /// `maxjobs - 1` tokens (this process holds the implicit last one)
    /// and republishes `MAKEFLAGS` so children inherit it.
    pub fn setup(maxjobs: usize) -> Result<Self, CoreError> {
        if let Some((r, w)) = parse_makeflags() {
            validate_fds(r, w)?;
            log::debug!("jobserver: adopted inherited pipe fds=({},{})", r, w);
            return Ok(JobController {
                // SAFETY: fds were just validated to be open and
                // pipe-shaped by `validate_fds`.
                read: unsafe { OwnedFd::from_raw_fd_checked(r) },
                write: unsafe { OwnedFd::from_raw_fd_checked(w) },
                pool_size: None,
                has_token: true,
                running: HashMap::new(),
            });
        }

        let limit = maxjobs.max(1);
        let (read, write) = create_token_pipe()?;
        seed_tokens(write.as_raw_fd(), limit - 1)?;

        publish_makeflags(read.as_raw_fd(), write.as_raw_fd());

        log::debug!("jobserver: created new pipe for {} tokens", limit);
        Ok(JobController {
            read,
            write,
            pool_size: Some(limit),
            has_token: true,
            running: HashMap::new(),
        })
    }

    /// Blocks until this process holds a token. Returns immediately if one
    /// is already held.
    ///
    /// While waiting, also services our own outstanding jobs: a token only
    /// ever returns to the pipe when some participant reaps a finished
    /// child, and with no other thread around to do that for us, a wait
    /// that only watched the raw pipe fd would deadlock as soon as every
    /// token was handed out to our own children.
    pub fn get_token(&mut self, reason: &str) -> Result<(), CoreError> {
        if self.has_token {
            return Ok(());
        }
        log::trace!("jobserver: waiting for token ({reason})");
        loop {
            if self.try_read_token()? {
                self.has_token = true;
                log::trace!("jobserver: acquired token ({reason})");
                return Ok(());
            }
            if self.running.is_empty() {
                poll_readable(self.read.as_raw_fd())?;
            } else {
                self.wait(true)?;
                if self.has_token {
                    log::trace!("jobserver: acquired token ({reason}) via a finished job");
                    return Ok(());
                }
            }
        }
    }

    /// Precondition: `has_token`. Writes one byte back to the pool and
    /// clears `has_token`.
    pub fn put_token(&mut self) -> Result<(), CoreError> {
        debug_assert!(self.has_token, "put_token called without a held token");
        write_bytes(self.write.as_raw_fd(), &[b'|'])?;
        self.has_token = false;
        Ok(())
    }

    /// Acquire a token, fork, and run `jobfunc` in the child. `donefunc`
    /// runs in the parent once the child has been reaped, receiving
    /// `reason` and its exit code (or `-signum` on abnormal termination).
    ///
    /// # Safety
    /// Forks the process. `jobfunc` runs in the child between `fork` and
    /// `process::exit`; only async-signal-safe operations should precede
    /// any `execvp` it performs.
    pub unsafe fn start_job<J, D>(&mut self, reason: &str, jobfunc: J, donefunc: D) -> Result<(), CoreError>
    where
        J: FnOnce() -> i32,
        D: FnOnce(&str, i32) + 'static,
    {
        self.get_token(reason)?;
        self.has_token = false;

        let (comp_read, comp_write) = create_completion_pipe()?;

        match unistd::fork().map_err(io_err)? {
            ForkResult::Child => {
                drop(comp_read);
                let rv = std::panic::catch_unwind(std::panic::AssertUnwindSafe(jobfunc))
                    .unwrap_or(201);
                drop(comp_write);
                std::process::exit(rv);
            }
            ForkResult::Parent { child } => {
                drop(comp_write);
                let fd = comp_read.as_raw_fd();
                std::mem::forget(comp_read); // ownership moves into `running`
                self.running.insert(
                    fd,
                    Completion {
                        name: reason.to_string(),
                        pid: child,
                        donefunc: Box::new(donefunc),
                    },
                );
                log::debug!("jobserver: started job '{reason}' pid={child}");
                Ok(())
            }
        }
    }

    /// Drain every outstanding job, returning our implicit token before
    /// blocking and reclaiming it afterward, then verify the pool is
    /// balanced if we own it.
    pub fn wait_all(&mut self) -> Result<(), CoreError> {
        while !self.running.is_empty() {
            if self.has_token {
                self.put_token()?;
            }
            self.wait(false)?;
        }
        if !self.has_token {
            self.get_token("wait_all reacquire")?;
        }
        if let Some(expected) = self.pool_size {
            self.verify_pool_balance(expected)?;
        }
        Ok(())
    }

    /// Select over every running job's completion fd (and, if `external`,
    /// the jobserver read fd too), reap whichever child finished, deposit
    /// its token, and invoke its `donefunc`.
    fn wait(&mut self, external: bool) -> Result<(), CoreError> {
        loop {
            let mut fds = FdSet::new();
            for &fd in self.running.keys() {
                fds.insert(unsafe { BorrowedFd::borrow_raw(fd) });
            }
            if external {
                fds.insert(unsafe { BorrowedFd::borrow_raw(self.read.as_raw_fd()) });
            }

            let n = retry_eintr(|| select(None, Some(&mut fds), None, None, None)).map_err(io_err)?;
            if n == 0 {
                continue;
            }

            let ready: Vec<RawFd> = self
                .running
                .keys()
                .copied()
                .filter(|fd| fds.contains(unsafe { BorrowedFd::borrow_raw(*fd) }))
                .collect();

            if ready.is_empty() {
                // Only the jobserver fd (an `external` wakeup with no
                // recipe completion) was ready; nothing to reap.
                return Ok(());
            }

            for fd in ready {
                self.reap_one(fd)?;
            }
            return Ok(());
        }
    }

    fn reap_one(&mut self, fd: RawFd) -> Result<(), CoreError> {
        let _ = unistd::close(fd);
        let completion = self
            .running
            .remove(&fd)
            .ok_or(InvariantViolation::UnknownCompletionFd)?;

        let status = waitpid(completion.pid, Some(WaitPidFlag::empty())).map_err(io_err)?;
        let rv = match status {
            WaitStatus::Exited(pid, code) => {
                if pid != completion.pid {
                    return Err(InvariantViolation::UnknownChild(pid.as_raw()).into());
                }
                code
            }
            WaitStatus::Signaled(_, sig, _) => -(sig as i32),
            other => {
                log::warn!("jobserver: unexpected wait status {other:?}");
                -1
            }
        };

        self.deposit_token()?;
        log::debug!(
            "jobserver: job '{}' (pid {}) finished rv={}",
            completion.name,
            completion.pid,
            rv
        );
        (completion.donefunc)(&completion.name, rv);
        Ok(())
    }

    /// Return one token to the pool: absorb it into `has_token` if free,
    /// otherwise write it back to the pipe.
    fn deposit_token(&mut self) -> Result<(), CoreError> {
        if self.has_token {
            write_bytes(self.write.as_raw_fd(), &[b'|'])?;
        } else {
            self.has_token = true;
        }
        Ok(())
    }

    /// Whether any job started by `start_job` is still outstanding.
    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// On abort: write back one token per outstanding completion so the
    /// shared pool is not permanently depleted. Best-effort; errors are
    /// logged, not propagated.
    pub fn force_return_tokens(&mut self) {
        for _ in 0..self.running.len() {
            if let Err(e) = write_bytes(self.write.as_raw_fd(), &[b'|']) {
                log::error!("jobserver: failed to return token during abort: {e}");
            }
        }
        self.running.clear();
    }

    fn verify_pool_balance(&self, expected: usize) -> Result<(), CoreError> {
        let available = available_bytes(self.read.as_raw_fd())?;
        if available != expected - 1 {
            return Err(InvariantViolation::TokenCountMismatch {
                expected: expected - 1,
                found: available,
            }
            .into());
        }
        Ok(())
    }

    /// Emulate a non-blocking read of one token byte: a zero-timeout
    /// `select` to probe readiness, then a blocking `read(1)` guarded by
    /// a one-second `SIGALRM` in case another process steals the byte
    /// between the two calls.
    fn try_read_token(&self) -> Result<bool, CoreError> {
        let mut fds = FdSet::new();
        let fd = unsafe { BorrowedFd::borrow_raw(self.read.as_raw_fd()) };
        fds.insert(fd);
        let mut timeout = TimeVal::new(0, 0);

        let n = select(None, Some(&mut fds), None, None, Some(&mut timeout)).map_err(io_err)?;
        if n == 0 || !fds.contains(fd) {
            return Ok(false);
        }

        let _alarm = AlarmGuard::arm(1)?;
        let mut buf = [0u8; 1];
        match unistd::read(self.read.as_raw_fd(), &mut buf) {
            Ok(1) => Ok(true),
            Ok(_) => Err(InvariantViolation::TokenPipeEof.into()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(io_err(e)),
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        if !self.running.is_empty() {
            log::warn!(
                "JobController dropped with {} job(s) still outstanding",
                self.running.len()
            );
            self.force_return_tokens();
        }
    }
}

/// Installs a one-shot `SIGALRM` whose only purpose is to interrupt a
/// blocking `read` with `EINTR`; cancels the pending alarm on drop.
struct AlarmGuard;

extern "C" fn sigalrm_noop(_: std::os::raw::c_int) {}

impl AlarmGuard {
    fn arm(secs: u32) -> Result<Self, CoreError> {
        unsafe {
            signal::signal(Signal::SIGALRM, SigHandler::Handler(sigalrm_noop)).map_err(io_err)?;
        }
        alarm::set(secs);
        Ok(AlarmGuard)
    }
}

impl Drop for AlarmGuard {
    fn drop(&mut self) {
        alarm::cancel();
    }
}

fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

fn poll_readable(fd: RawFd) -> Result<(), CoreError> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    retry_eintr(|| poll(&mut fds, PollTimeout::NONE)).map_err(io_err)?;
    Ok(())
}

fn write_bytes(fd: RawFd, buf: &[u8]) -> Result<(), CoreError> {
    let n = retry_eintr(|| unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, buf)).map_err(io_err)?;
    if n != buf.len() {
        return Err(InvariantViolation::TokenPipeEof.into());
    }
    Ok(())
}

fn seed_tokens(write_fd: RawFd, count: usize) -> Result<(), CoreError> {
    const CHUNK: [u8; 128] = [b'|'; 128];
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(CHUNK.len());
        write_bytes(write_fd, &CHUNK[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn available_bytes(fd: RawFd) -> Result<usize, CoreError> {
    let mut len: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut len as *mut libc::c_int) };
    if ret == -1 {
        return Err(io_err(Errno::last()));
    }
    Ok(len as usize)
}

/// Create a pipe with both ends close-on-exec: the jobserver pipe should
/// be inheritable only through the explicit `MAKEFLAGS` republish, never
/// by accident.
fn create_token_pipe() -> Result<(OwnedFd, OwnedFd), CoreError> {
    let (read, write) = pipe_cloexec()?;
    Ok((read, write))
}

/// Create the per-job completion pipe. The read end is close-on-exec
/// (the parent never execs, but keeps this from leaking into any other
/// child it later forks); the write end must *not* be close-on-exec, so
/// it survives the child's `execvp` into the recipe and only closes when
/// that recipe process truly exits, which is what wakes the parent.
fn create_completion_pipe() -> Result<(OwnedFd, OwnedFd), CoreError> {
    let (read, write) = unistd::pipe().map_err(io_err)?;
    set_cloexec(read.as_raw_fd(), true)?;
    Ok((read, write))
}

fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), CoreError> {
    let (read, write) = unistd::pipe().map_err(io_err)?;
    set_cloexec(read.as_raw_fd(), true)?;
    set_cloexec(write.as_raw_fd(), true)?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd, set: bool) -> Result<(), CoreError> {
    let flag = if set { FdFlag::FD_CLOEXEC } else { FdFlag::empty() };
    fcntl(fd, FcntlArg::F_SETFD(flag)).map_err(io_err)?;
    Ok(())
}

fn publish_makeflags(read_fd: RawFd, write_fd: RawFd) {
    let existing = env::var(MAKEFLAGS).unwrap_or_default();
    let addition = format!(" --jobserver-fds={},{}", read_fd, write_fd);
    env::set_var(MAKEFLAGS, format!("{}{}", existing, addition));
}

/// Parse `--jobserver-fds=R,W` out of `MAKEFLAGS`.
fn parse_makeflags() -> Option<(RawFd, RawFd)> {
    let flags = env::var(MAKEFLAGS).ok()?;
    for token in flags.split_whitespace() {
        if let Some(rest) = token.strip_prefix("--jobserver-fds=") {
            let (r, w) = rest.split_once(',')?;
            return Some((r.parse().ok()?, w.parse().ok()?));
        }
    }
    None
}

fn validate_fds(r: RawFd, w: RawFd) -> Result<(), CoreError> {
    for fd in [r, w] {
        if fcntl(fd, FcntlArg::F_GETFD).is_err() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("jobserver fd {} from MAKEFLAGS is not open", fd),
            )));
        }
    }
    Ok(())
}

/// Narrow extension trait so `JobController::setup` can construct an
/// `OwnedFd` from a validated raw fd without pulling in
/// `std::os::unix::io::FromRawFd` at the call site (that trait's
/// constructor is unsafe for good reason: it asserts unique ownership of
/// an fd this process did not open itself).
trait FromRawFdChecked {
    /// # Safety
    /// `fd` must be open, not already owned elsewhere in this process.
    unsafe fn from_raw_fd_checked(fd: RawFd) -> Self;
}

impl FromRawFdChecked for OwnedFd {
    unsafe fn from_raw_fd_checked(fd: RawFd) -> Self {
        use std::os::unix::io::FromRawFd;
        OwnedFd::from_raw_fd(fd)
    }
}

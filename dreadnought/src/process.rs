//! Detached process spawning.
//!
//! Every worker and the overflow controller is a grandchild: the intermediate
//! child forks once more and exits immediately, so the spawner never has to reap
//! long-lived processes and none of them can become a zombie under it. The
//! grandchild starts a new session, closes every descriptor it inherited except
//! stdio and the ones it was told to keep, runs its body and leaves with
//! `_exit` so no destructor or atexit handler of the spawner runs twice.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork, setsid};

/// Exit code of a grandchild whose body panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

const INTERMEDIATE_FORK_FAILED: i32 = 71;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    #[error("waiting for the intermediate child failed: {0}")]
    Wait(#[source] Errno),

    #[error("intermediate child did not exit cleanly: {0:?}")]
    Intermediate(WaitStatus),
}

/// Run `body` in a detached grandchild process.
///
/// Returns once the intermediate child has been reaped; the grandchild keeps
/// running independently. `keep` lists the descriptors the body needs.
///
/// Fork only copies the calling thread. Call this before starting a
/// multi-threaded runtime, or from a process whose other threads hold no locks
/// the body will need.
pub fn spawn_detached<F>(keep: &[RawFd], body: F) -> Result<(), SpawnError>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the child branches below only fork again, close descriptors, run
    // the caller's body and `_exit`; they never return into the caller's stack.
    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                Ok(status) => return Err(SpawnError::Intermediate(status)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SpawnError::Wait(e)),
            }
        },
        ForkResult::Child => {
            let code = match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => 0,
                Ok(ForkResult::Child) => run_grandchild(keep, body),
                Err(_) => INTERMEDIATE_FORK_FAILED,
            };
            // SAFETY: terminating the forked child without unwinding.
            unsafe { nix::libc::_exit(code) }
        }
    }
}

fn run_grandchild<F>(keep: &[RawFd], body: F) -> !
where
    F: FnOnce() -> i32,
{
    let _ = setsid();
    close_fds_except(keep);
    let code = catch_unwind(AssertUnwindSafe(body)).unwrap_or(PANIC_EXIT_CODE);
    // SAFETY: terminating the forked child without unwinding.
    unsafe { nix::libc::_exit(code) }
}

/// Close every open descriptor above stderr that is not in `keep`.
pub fn close_fds_except(keep: &[RawFd]) {
    let keep: HashSet<RawFd> = keep.iter().copied().collect();
    for fd in open_fds() {
        if fd > 2 && !keep.contains(&fd) {
            // SAFETY: plain close(2); a number that is no longer open yields EBADF.
            unsafe { nix::libc::close(fd) };
        }
    }
}

fn open_fds() -> Vec<RawFd> {
    // Collected before closing anything: the directory handle is itself an fd.
    match std::fs::read_dir("/proc/self/fd").or_else(|_| std::fs::read_dir("/dev/fd")) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => (3..1024).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{PipeFd, pipe_pair};
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn grandchild_runs_and_reports_over_kept_pipe() {
        let (mut r, w) = pipe_pair().unwrap();
        let keep = [w.as_raw_fd()];

        // The parent's copy of `w` is dropped with the closure.
        spawn_detached(&keep, move || {
            let mut w: PipeFd = w;
            let _ = write!(w, "{}", std::process::id());
            0
        })
        .unwrap();

        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        let pid: u32 = out.parse().unwrap();
        assert_ne!(pid, std::process::id());
    }

    #[test]
    fn unkept_descriptors_are_closed_in_grandchild() {
        let (mut report_r, report_w) = pipe_pair().unwrap();
        let (probe_r, probe_w) = pipe_pair().unwrap();
        let probe = probe_w.as_raw_fd();
        let keep = [report_w.as_raw_fd()];

        spawn_detached(&keep, move || {
            let mut report = report_w;
            let open = nix::fcntl::fcntl(
                unsafe { std::os::unix::io::BorrowedFd::borrow_raw(probe) },
                nix::fcntl::FcntlArg::F_GETFD,
            )
            .is_ok();
            let msg: &[u8] = if open { b"open" } else { b"closed" };
            let _ = report.write_all(msg);
            0
        })
        .unwrap();

        let mut out = String::new();
        report_r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "closed");

        // The grandchild held no write end, so the probe reads EOF once ours is gone.
        drop(probe_w);
        let mut probe_r = probe_r;
        let mut rest = Vec::new();
        probe_r.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}

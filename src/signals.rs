//! Signal handling and the process-wide shutdown flag.
//!
//! INT, TERM, and PIPE all request the same serialized shutdown; the
//! handler only flips an atomic, and the single main loop observes it, so
//! concurrent signals collapse into one shutdown run. HUP is ignored.

use anyhow::{Context, Result};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the supervisor's handlers.
pub fn install() -> Result<()> {
    let handler = request_shutdown as extern "C" fn(libc::c_int);
    for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGPIPE] {
        // SAFETY: the handler is async-signal-safe (a single atomic store).
        if unsafe { libc::signal(signum, handler as libc::sighandler_t) } == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("install handler for signal {signum}"));
        }
    }
    // SAFETY: setting a disposition to SIG_IGN installs no handler.
    if unsafe { libc::signal(libc::SIGHUP, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(std::io::Error::last_os_error()).context("ignore SIGHUP");
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Stop accepting shutdown signals once shutdown has begun.
pub fn ignore_further() {
    for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGPIPE] {
        // SAFETY: setting a disposition to SIG_IGN installs no handler.
        unsafe { libc::signal(signum, libc::SIG_IGN) };
    }
}

/// Reap every zombie currently waiting on us. As PID 1 the supervisor
/// inherits orphaned descendants; their exit statuses land here too, so the
/// caller gets raw `(pid, status)` pairs to match against tracked children.
pub fn drain_zombies() -> Vec<(u32, ExitStatus)> {
    let mut reaped = Vec::new();
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid(-1, .., WNOHANG) polls without blocking and writes
        // the status through a valid pointer.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped.push((pid as u32, ExitStatus::from_raw(status)));
    }
    reaped
}

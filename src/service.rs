//! Process lifecycle
//!
//! Single-instance locking, daemonization, and the operator signal. This is
//! the only module that talks to libc directly. The signal handler does
//! nothing but raise a flag; the supervision loop drains it on its next
//! tick, so no supervisor state is ever reachable from signal context.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context as _, Result};
use tracing::debug;

/// Well-known lock path guaranteeing a single running instance.
pub const DEFAULT_PID_FILE: &str = "/var/run/usb_supervisor.pid";

static RESET_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Holds the advisory lock for the life of the process.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
}

/// Take the exclusive advisory lock, failing immediately if another
/// instance holds it. The caller must keep the returned guard alive.
pub fn lock_instance(path: &Path) -> Result<InstanceLock> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        bail!("another instance already holds {}", path.display());
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(InstanceLock { _file: file })
}

extern "C" fn on_reset_signal(_signum: libc::c_int) {
    RESET_REQUESTED.store(true, Ordering::Relaxed);
}

/// Route SIGUSR1 to the reset-request flag.
pub fn install_signal_handler() -> Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_reset_signal as libc::sighandler_t;
    let rc = unsafe { libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) };
    if rc != 0 {
        bail!(
            "could not install SIGUSR1 handler: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// True once per operator reset request.
pub fn take_reset_request() -> bool {
    RESET_REQUESTED.swap(false, Ordering::Relaxed)
}

/// Detach from the controlling terminal, keeping cwd and open files.
pub fn daemonize() -> Result<()> {
    let rc = unsafe { libc::daemon(1, 1) };
    if rc != 0 {
        bail!("failed to daemonize: {}", std::io::Error::last_os_error());
    }
    debug!("detached from controlling terminal");
    Ok(())
}

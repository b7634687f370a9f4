//! Escalating termination of a job's process group.
//!
//! Jobs are spawned as leaders of their own process group, so signalling the
//! group reaches every descendant the script forked.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exit code recorded for a job stopped by SIGTERM.
pub const TERMINATED_EXIT_CODE: i32 = -nix::libc::SIGTERM;

/// Poll intervals to wait for the group to disappear after SIGKILL.
const KILL_POLLS: u32 = 10;

/// SIGTERM, wait, SIGKILL.
#[derive(Debug, Clone)]
pub struct ProcessTreeTerminator {
    poll_interval: Duration,
}

impl Default for ProcessTreeTerminator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ProcessTreeTerminator {
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Terminate the process group led by `pid`.
    ///
    /// Returns `true` once no member of the group is left, including when
    /// the group was already gone before any signal was sent. Use
    /// [`Self::terminate_child`] for processes this process spawned, since an
    /// unreaped leader keeps its group visible.
    pub async fn terminate(&self, pid: u32, grace: Duration) -> bool {
        let Some(pid) = to_pid(pid) else {
            warn!(pid, "refusing to signal invalid pid");
            return false;
        };
        self.escalate(pid, grace, || group_alive(pid)).await
    }

    /// Terminate the process group of a child spawned by this process.
    pub async fn terminate_child(&self, child: &mut Child, grace: Duration) -> bool {
        let Some(pid) = child.id().and_then(to_pid) else {
            // Already reaped.
            return true;
        };
        self.escalate(pid, grace, || {
            // Reap the leader so a zombie does not keep the group alive.
            let _ = child.try_wait();
            group_alive(pid)
        })
        .await
    }

    async fn escalate<F>(&self, pid: Pid, grace: Duration, mut alive: F) -> bool
    where
        F: FnMut() -> bool,
    {
        if !signal_group(pid, Signal::SIGTERM) {
            return true;
        }
        debug!(pid = pid.as_raw(), grace_ms = grace.as_millis(), "sent SIGTERM to process group");

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !alive() {
                return true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        if !alive() {
            return true;
        }

        info!(pid = pid.as_raw(), "grace period elapsed, sending SIGKILL");
        if !signal_group(pid, Signal::SIGKILL) {
            return true;
        }

        for _ in 0..KILL_POLLS {
            tokio::time::sleep(self.poll_interval).await;
            if !alive() {
                return true;
            }
        }
        warn!(pid = pid.as_raw(), "process group survived SIGKILL");
        false
    }
}

/// Name of this host, recorded next to the pids it spawns.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|&raw| raw > 1)
        .map(Pid::from_raw)
}

/// Signals the group. Returns `false` when the group no longer exists.
fn signal_group(pid: Pid, signal: Signal) -> bool {
    match killpg(pid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            // The leader may have left its group; fall back to the process.
            warn!(pid = pid.as_raw(), signal = %signal, error = %e, "killpg failed, signalling process");
            !matches!(kill(pid, signal), Err(Errno::ESRCH))
        }
    }
}

/// True while any process is left in the group.
fn group_alive(pgid: Pid) -> bool {
    !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}

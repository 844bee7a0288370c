//! Fence dispatcher: fork+exec the configured fence binary against a node
//! that has been marked expired, and reap it via `SIGCHLD`.
//!
//! Grounded on `examples/original_source/gulm/src/core_fence.c`'s
//! `fence_node` (fork/exec, fd closing, retry-on-fork-failure),
//! `queue_node_for_fencing` (the pending-fence list) and
//! `check_for_zombied_stomiths` (the reap callback: success means
//! `Killed`, failure means refork after a delay, role loss means silent
//! drop). The `SIGCHLD` reap loop that drives `reap()` lives in
//! `core.rs::fence_reap_loop`, modeled on
//! `pkg/container/src/runtime/runtime.rs`'s `run_waitpid`, adapted from its
//! `nix` 0.21 API (`waitpid`/`WaitPidFlag`) rather than the newer
//! `sys::waitpid` wrapper that crate's `executor` layer provides.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::time::Duration;

use common::errors::*;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Outcome of reaping one queued fence action.
#[derive(Debug, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The fence binary exited zero: the node is confirmed dead.
    Killed(String),
    /// The fence binary failed; the caller should refork after a delay.
    Retry(String),
    /// The process lost Master/Arbitrator role before the fence resolved;
    /// the entry is dropped without any announcement.
    SilentDrop(String),
}

const REFORK_DELAY: Duration = Duration::from_secs(5);
const FORK_FAILURE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Tracks in-flight fence children by PID so a `SIGCHLD` reap can be
/// attributed back to the node name that triggered it.
pub struct FenceDispatcher {
    fence_bin: String,
    pending: HashMap<u32, String>,
}

impl FenceDispatcher {
    pub fn new(fence_bin: String) -> Self {
        Self {
            fence_bin,
            pending: HashMap::new(),
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.values().any(|n| n == name)
    }

    /// `queue_node_for_fencing`: spawn `fence_bin <node_name>` and track the
    /// child. Closing fds >= 3 is `std::process::Command`'s default
    /// behavior for any descriptor not explicitly inherited, since it does
    /// not inherit the parent's open file table beyond stdio.
    pub async fn queue_node_for_fencing(&mut self, node_name: &str) -> Result<()> {
        loop {
            match Command::new(&self.fence_bin)
                .arg(node_name)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => {
                    self.pending.insert(child.id(), node_name.to_string());
                    return Ok(());
                }
                Err(_) => {
                    common::wait_for(FORK_FAILURE_RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    async fn refork_after_delay(&mut self, node_name: String) {
        common::wait_for(REFORK_DELAY).await;
        let _ = self.queue_node_for_fencing(&node_name).await;
    }

    /// Looks up `pid` among pending fences and removes it, returning which
    /// node it corresponded to if any (a `SIGCHLD` can fire for unrelated
    /// children too, e.g. none exist in this process, so `None` is normal).
    fn take_pending(&mut self, pid: u32) -> Option<String> {
        self.pending.remove(&pid)
    }

    /// Processes one `waitpid` result. `currently_authoritative` is true
    /// when this process is still Master or Arbitrator; if it has lost
    /// that role the pending entry is dropped without acting on it
    /// (`check_for_zombied_stomiths`'s role check).
    pub async fn reap(&mut self, status: WaitStatus, currently_authoritative: bool) -> Option<ReapOutcome> {
        let (pid, exited_zero) = match status {
            WaitStatus::Exited(pid, code) => (pid, code == 0),
            WaitStatus::Signaled(pid, _, _) => (pid, false),
            WaitStatus::Stopped(pid, _) => (pid, false),
            _ => return None,
        };

        let name = self.take_pending(pid.as_raw() as u32)?;

        if !currently_authoritative {
            return Some(ReapOutcome::SilentDrop(name));
        }

        if exited_zero {
            Some(ReapOutcome::Killed(name))
        } else {
            self.refork_after_delay(name.clone()).await;
            Some(ReapOutcome::Retry(name))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_tracking() {
        let mut d = FenceDispatcher::new("/bin/true".to_string());
        d.pending.insert(42, "node-a".to_string());
        assert!(d.is_pending("node-a"));
        assert_eq!(d.take_pending(42), Some("node-a".to_string()));
        assert!(!d.is_pending("node-a"));
    }

    #[test]
    fn reap_success_yields_killed() {
        common::async_std::task::block_on(async {
            let mut d = FenceDispatcher::new("/bin/true".to_string());
            d.pending.insert(7, "node-b".to_string());
            let outcome = d
                .reap(WaitStatus::Exited(Pid::from_raw(7), 0), true)
                .await;
            assert_eq!(outcome, Some(ReapOutcome::Killed("node-b".to_string())));
        });
    }

    #[test]
    fn reap_while_not_authoritative_is_silent() {
        common::async_std::task::block_on(async {
            let mut d = FenceDispatcher::new("/bin/true".to_string());
            d.pending.insert(7, "node-b".to_string());
            let outcome = d
                .reap(WaitStatus::Exited(Pid::from_raw(7), 0), false)
                .await;
            assert_eq!(outcome, Some(ReapOutcome::SilentDrop("node-b".to_string())));
        });
    }

    #[test]
    fn unrelated_pid_is_ignored() {
        common::async_std::task::block_on(async {
            let mut d = FenceDispatcher::new("/bin/true".to_string());
            let outcome = d
                .reap(WaitStatus::Exited(Pid::from_raw(999), 0), true)
                .await;
            assert_eq!(outcome, None);
        });
    }
}

//! Child-process guard.
//!
//! Tasks spawn shells; long-running descendants of those shells would
//! survive an unexpected supervisor exit without process-group signaling.
//! Every live child pid is registered here together with its task's
//! terminal signal, and an `atexit` hook signals whatever is left when the
//! process terminates, normally or otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

static PIDS: Mutex<Vec<(u32, i32)>> = Mutex::new(Vec::new());
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Track a live child. Installs the exit hook on first use.
pub fn register_pid(pid: u32, term_signal: i32) {
    if !INSTALLED.swap(true, Ordering::SeqCst) {
        // SAFETY: cleanup_pids is an extern "C" fn with no arguments and
        // touches only process-global state.
        unsafe {
            libc::atexit(cleanup_pids);
        }
    }
    let mut pids = PIDS.lock().unwrap_or_else(|e| e.into_inner());
    if !pids.iter().any(|(p, _)| *p == pid) {
        pids.push((pid, term_signal));
    }
}

/// Forget a child that has been reaped.
pub fn unregister_pid(pid: u32) {
    let mut pids = PIDS.lock().unwrap_or_else(|e| e.into_inner());
    pids.retain(|(p, _)| *p != pid);
}

#[cfg(test)]
pub(crate) fn registered_pids() -> Vec<u32> {
    PIDS.lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .map(|(p, _)| *p)
        .collect()
}

/// Signal `pid`, and optionally its process group, swallowing ESRCH.
pub fn kill_pid(pid: u32, sig: i32, group: bool) {
    debug!(pid, sig, group, "signaling child");
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2)/killpg(2) accept any pid; a stale pid yields ESRCH.
    unsafe {
        if group {
            let pgid = libc::getpgid(pid);
            if pgid > 0 {
                libc::killpg(pgid, sig);
            }
        }
        libc::kill(pid, sig);
    }
}

extern "C" fn cleanup_pids() {
    // Snapshot under the lock, signal outside it.
    let snapshot: Vec<(u32, i32)> = {
        let pids = PIDS.lock().unwrap_or_else(|e| e.into_inner());
        pids.clone()
    };
    for (pid, sig) in snapshot {
        kill_pid(pid, sig, true);
    }
}

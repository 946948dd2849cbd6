//! Running code inside another process's network namespace.
//!
//! Namespace membership belongs to the OS thread, not to the process or to
//! a tokio task. The work therefore runs on a dedicated thread that drives
//! its own current-thread runtime, so nothing can migrate it to another
//! worker while it is switched. [`NetnsGuard`] switches back when dropped,
//! whichever way the work ends.

use std::{fs::File, future::Future, thread};

use log::{debug, error};
use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;

use crate::core::error::{NetError, Result};

/// Holds the calling thread inside a target network namespace.
pub struct NetnsGuard {
    original: File,
    pid: i32,
}

impl NetnsGuard {
    /// Switch the calling thread into the network namespace of `pid`.
    pub fn enter(pid: i32) -> Result<Self> {
        let target_path = format!("/proc/{pid}/ns/net");
        let target = File::open(&target_path).map_err(|e| {
            NetError::namespace(format!("failed to open {target_path}"), Some(Box::new(e)))
        })?;

        let original = File::open("/proc/thread-self/ns/net").map_err(|e| {
            NetError::namespace("failed to open current network namespace", Some(Box::new(e)))
        })?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| {
            NetError::namespace(format!("failed to join {target_path}"), Some(Box::new(e)))
        })?;

        debug!("Entered network namespace of {pid}");
        Ok(Self { original, pid })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match setns(&self.original, CloneFlags::CLONE_NEWNET) {
            Ok(()) => debug!("Left network namespace of {}", self.pid),
            Err(e) => error!(
                "Failed to restore network namespace after leaving {}: {e}",
                self.pid
            ),
        }
    }
}

/// Run `work` inside the network namespace of `pid` and hand back its result.
///
/// Must not be called concurrently for the same thread; each call gets its
/// own thread.
pub async fn run_in_netns<F, Fut, T>(pid: i32, work: F) -> Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>>,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name(format!("netns-{pid}"))
        .spawn(move || {
            let _ = tx.send(enter_and_run(pid, work));
        })
        .map_err(|e| NetError::namespace("failed to spawn namespace thread", Some(Box::new(e))))?;

    rx.await
        .map_err(|_| NetError::namespace("namespace thread exited without a result", None))?
}

fn enter_and_run<F, Fut, T>(pid: i32, work: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| NetError::namespace("failed to build namespace runtime", Some(Box::new(e))))?;

    let _guard = NetnsGuard::enter(pid)?;
    runtime.block_on(work())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_process_is_namespace_error() {
        // Pids are capped well below i32::MAX.
        let result = run_in_netns(i32::MAX, || async { Ok(()) }).await;

        assert!(matches!(result, Err(NetError::Namespace { .. })));
    }

    #[tokio::test]
    async fn test_work_error_propagates() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }

        let pid = std::process::id() as i32;
        let result: Result<()> =
            run_in_netns(pid, || async { Err(NetError::invalid("boom")) }).await;

        assert!(matches!(result, Err(NetError::InvalidArgument { .. })));
    }
}

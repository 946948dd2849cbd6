use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::time::{sleep, Instant};

use super::{
    release_resources,
    record::{process_alive, ContainerStatus, Records},
};
use crate::core::{cmd::StopArgs, StatePaths};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stop a container and give back its address, published ports and cgroup.
///
/// The record stays, marked `Stopped`, until `rm`.
pub async fn stop_container(stop_args: StopArgs, paths: &StatePaths) -> anyhow::Result<i32> {
    let records = Records::new(paths);
    let mut record = records
        .get(&stop_args.name)
        .with_context(|| format!("Failed to stop container {}", stop_args.name))?;

    if record.observed_status() == ContainerStatus::Running {
        terminate(Pid::from_raw(record.pid), Duration::from_secs(stop_args.time)).await?;
    }

    release_resources(&mut record, paths).await;
    if record.endpoint.is_some() {
        warn!("Container {} keeps its network endpoint for a later retry", record.name);
    }

    record.status = ContainerStatus::Stopped;
    record.pid = 0;
    records.save(&record)?;

    info!("Container {} stopped", record.name);
    Ok(0)
}

/// SIGTERM, then SIGKILL once `grace` has passed.
pub(super) async fn terminate(pid: Pid, grace: Duration) -> anyhow::Result<()> {
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => return Err(anyhow::Error::from(e).context(format!("Failed to signal {pid}"))),
    }

    if wait_gone(pid, grace).await {
        return Ok(());
    }

    warn!("Process {pid} ignored SIGTERM for {grace:?}, killing it");
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(anyhow::Error::from(e).context(format!("Failed to kill {pid}"))),
    }

    let gone = wait_gone(pid, grace.max(Duration::from_secs(1))).await;
    anyhow::ensure!(gone, "Process {pid} survived SIGKILL");
    Ok(())
}

async fn wait_gone(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if !process_alive(pid.as_raw()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::core::container::ContainerRecord;

    fn spawn(script: &str) -> Child {
        Command::new("sh").args(["-c", script]).spawn().unwrap()
    }

    /// Reap in the background so the child does not linger as a zombie.
    fn reaper(mut child: Child) -> Pid {
        let pid = Pid::from_raw(child.id() as i32);
        std::thread::spawn(move || child.wait());
        pid
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let pid = reaper(spawn("exec sleep 30"));

        terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!process_alive(pid.as_raw()));
    }

    #[tokio::test]
    async fn test_terminate_escalates() {
        let pid = reaper(spawn("trap '' TERM; while :; do sleep 0.1; done"));
        sleep(Duration::from_millis(500)).await;

        let started = Instant::now();
        terminate(pid, Duration::from_millis(300)).await.unwrap();

        assert!(!process_alive(pid.as_raw()));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_terminate_gone_process() {
        terminate(Pid::from_raw(i32::MAX), Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_container() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let pid = reaper(spawn("exec sleep 30"));

        let records = Records::new(&paths);
        records
            .register(&ContainerRecord::new("id", "c1", pid.as_raw(), vec!["sleep".to_string()], vec![]))
            .unwrap();

        let args = StopArgs {
            name: "c1".to_string(),
            time: 5,
        };
        assert_eq!(stop_container(args, &paths).await.unwrap(), 0);

        let record = records.get("c1").unwrap();
        assert_eq!(record.status, ContainerStatus::Stopped);
        assert_eq!(record.pid, 0);
        assert!(!process_alive(pid.as_raw()));
    }

    #[tokio::test]
    async fn test_stop_unknown_container() {
        let dir = TempDir::new().unwrap();
        let args = StopArgs {
            name: "nope".to_string(),
            time: 1,
        };

        assert!(stop_container(args, &StatePaths::new(dir.path())).await.is_err());
    }
}

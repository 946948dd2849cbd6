use std::{fs::File, process::exit};

use anyhow::Context;
use log::{debug, error};
use nix::{
    sched::{setns, CloneFlags},
    sys::wait::waitpid,
    unistd::{execvp, fork, ForkResult},
};

use super::{
    exit_code,
    record::{ContainerStatus, Records},
    to_cstrings,
};
use crate::core::{cmd::ExecArgs, StatePaths};

/// Joined in this order; `mnt` last so the earlier `/proc` handles stay valid.
const NAMESPACES: [&str; 5] = ["ipc", "uts", "net", "pid", "mnt"];

/// Run a command inside the namespaces of a running container.
///
/// Must be called while the process is still single threaded, the kernel
/// refuses to move a multithreaded process into another mount namespace.
pub fn exec_container(exec_args: ExecArgs, paths: &StatePaths) -> anyhow::Result<i32> {
    let command = to_cstrings(&exec_args.command)?;
    let pid = resolve_pid(&exec_args.container, paths)?;

    enter_ns(pid).with_context(|| format!("Failed to enter namespaces of {pid}"))?;
    debug!("Entered namespaces of {} ({pid})", exec_args.container);

    // SAFETY: single threaded here, the child only execs.
    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).context("Failed to wait for command")?;
            Ok(exit_code(status))
        }
        ForkResult::Child => {
            if let Err(e) = execvp(&command[0], &command) {
                error!("Failed to exec {:?} in container: {e}", command[0]);
            }
            exit(127)
        }
    }
}

/// A container name, or a bare pid for processes rtain does not know about.
fn resolve_pid(container: &str, paths: &StatePaths) -> anyhow::Result<i32> {
    match Records::new(paths).get(container) {
        Ok(record) => {
            anyhow::ensure!(
                record.observed_status() == ContainerStatus::Running,
                "Container {container} is not running"
            );
            Ok(record.pid)
        }
        Err(e) if e.is_not_found() => container
            .parse()
            .map_err(|_| anyhow::Error::from(e)),
        Err(e) => Err(e.into()),
    }
}

fn enter_ns(pid: i32) -> anyhow::Result<()> {
    let handles = NAMESPACES
        .iter()
        .map(|ns| {
            let nspath = format!("/proc/{}/ns/{}", pid, ns);
            File::open(&nspath).with_context(|| format!("Failed to open {nspath}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    // The pid namespace only applies to children, hence the fork afterwards.
    for (ns, file) in NAMESPACES.iter().zip(&handles) {
        setns(file, CloneFlags::empty()).with_context(|| format!("Failed to join {ns} namespace"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::core::container::ContainerRecord;

    fn args(container: &str, command: &[&str]) -> ExecArgs {
        ExecArgs {
            container: container.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_exec_unknown_container() {
        let dir = TempDir::new().unwrap();

        let err = exec_container(args("nope", &["true"]), &StatePaths::new(dir.path())).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_exec_stopped_container() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let mut record = ContainerRecord::new("id", "c1", 0, vec![], vec![]);
        record.status = ContainerStatus::Stopped;
        Records::new(&paths).register(&record).unwrap();

        let err = exec_container(args("c1", &["true"]), &paths).unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn test_exec_unknown_pid() {
        let dir = TempDir::new().unwrap();
        let pid = i32::MAX.to_string();

        let err = exec_container(args(&pid, &["true"]), &StatePaths::new(dir.path())).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to open /proc/"));
    }

    #[test]
    fn test_exec_empty_command() {
        let dir = TempDir::new().unwrap();

        assert!(exec_container(args("1", &[]), &StatePaths::new(dir.path())).is_err());
    }
}

use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::Context;
use cgroups_rs::{cgroup_builder::CgroupBuilder, CgroupPid};
use log::{debug, error, info, warn};
use nix::{
    libc::SIGCHLD,
    sched::{clone, CloneFlags},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{close, execvp, pipe, read, write, Pid},
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc::{self, UnboundedReceiver},
};

use super::{
    exit_code, random_id, release_resources,
    record::{ContainerRecord, ContainerStatus, Records},
    to_cstrings,
};
use crate::core::{cmd::RunArgs, network::Networks, StatePaths};

/// Start `run_args.command` in new namespaces, wire it up and, unless
/// detached, wait for it.
///
/// The child blocks on a pipe until resource limits and networking are in
/// place; setup failures make it exit without running anything.
pub async fn run_container(run_args: RunArgs, paths: StatePaths) -> anyhow::Result<i32> {
    let command = to_cstrings(&run_args.command)?;

    let id = random_id();
    let name = run_args.name.clone().unwrap_or_else(|| id[..12].to_string());
    let records = Records::new(&paths);
    match records.get(&name) {
        Ok(_) => anyhow::bail!("Container name {name} is already in use"),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    // Installed before the child exists, so no signal slips past.
    let mut signals = match run_args.detach {
        true => None,
        false => Some(listen_signals().context("Failed to install signal handlers")?),
    };

    let (read_fd, write_fd) = pipe().context("Failed to create pipe")?;
    let child = new_container_process(read_fd, &write_fd, &command)
        .context("Failed to create new namespace process")?;
    info!("Container {name} ({id}) created with pid {child}");

    let mut container = Container {
        record: ContainerRecord::new(
            &id,
            &name,
            child.as_raw(),
            run_args.command.clone(),
            run_args.port.clone(),
        ),
        paths,
        registered: false,
    };

    if let Err(e) = container.prepare(&run_args).await {
        error!("Failed to set up container {name}: {e:?}");

        let _ = write(&write_fd, b"EXIT");
        reap(child).await;
        container.teardown().await;

        return Err(e);
    }

    // Let the init continue.
    if let Err(e) = write(&write_fd, b"CONT") {
        error!("Failed to release container {name}: {e}");

        let _ = kill(child, Signal::SIGKILL);
        reap(child).await;
        container.teardown().await;

        return Err(anyhow::Error::from(e).context("Failed to release container process"));
    }
    drop(write_fd);

    let Some(signals) = signals.as_mut() else {
        info!("Container {name} running in background with pid {child}");
        println!("{id}");
        return Ok(0);
    };

    let status = supervise(child, signals).await;
    container.teardown().await;

    let status = status?;
    info!("Container {name} exited: {status:?}");
    Ok(exit_code(status))
}

struct Container {
    record: ContainerRecord,
    paths: StatePaths,
    registered: bool,
}

impl Container {
    async fn prepare(&mut self, run_args: &RunArgs) -> anyhow::Result<()> {
        let records = Records::new(&self.paths);
        records
            .register(&self.record)
            .with_context(|| format!("Failed to record container {}", self.record.name))?;
        self.registered = true;

        if let Some(memory) = run_args.memory {
            let cg_name = format!("{}-{}", self.record.name, self.record.id);
            setup_cgroup(&cg_name, Pid::from_raw(self.record.pid), memory)?;
            self.record.cgroup = Some(cg_name);
        }

        match &run_args.net {
            Some(net) => {
                let networks = Networks::init(self.paths.clone())?;
                let endpoint = networks
                    .connect(net, &self.record.info())
                    .await
                    .with_context(|| format!("Failed to connect {} to network {net}", self.record.name))?;
                self.record.endpoint = Some(endpoint);
            }
            None if !run_args.port.is_empty() => {
                warn!("Ports {:?} ignored, no network given", run_args.port);
            }
            None => {}
        }

        records.save(&self.record)?;
        Ok(())
    }

    /// Release everything and forget the container.
    async fn teardown(&mut self) {
        let records = Records::new(&self.paths);

        // A `stop` from elsewhere has already released what it recorded.
        if self.registered {
            if let Ok(stored) = records.get(&self.record.name) {
                if stored.status == ContainerStatus::Stopped {
                    self.record = stored;
                }
            }
        }

        release_resources(&mut self.record, &self.paths).await;

        if self.registered {
            if let Err(e) = records.deregister(&self.record.name) {
                error!("Failed to remove record of container {}: {e}", self.record.name);
            }
        }
    }
}

/// SIGINT and SIGTERM delivered to `rtain run` itself.
fn listen_signals() -> std::io::Result<UnboundedReceiver<Signal>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = interrupt.recv() => Signal::SIGINT,
                Some(()) = terminate.recv() => Signal::SIGTERM,
                else => break,
            };
            if tx.send(sig).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Wait for `child`, passing on every signal received meanwhile.
///
/// A container init ignores signals it has no handler for, so the second
/// one is sent as SIGKILL.
async fn supervise(child: Pid, signals: &mut UnboundedReceiver<Signal>) -> anyhow::Result<WaitStatus> {
    let mut waiter = tokio::task::spawn_blocking(move || waitpid(child, None));
    let mut forwarded = false;

    loop {
        tokio::select! {
            status = &mut waiter => {
                return status
                    .context("Failed to wait for container")?
                    .context("Failed to wait for container");
            }
            Some(sig) = signals.recv() => {
                let sig = if forwarded { Signal::SIGKILL } else { sig };
                info!("Forwarding {sig:?} to container process {child}");

                if let Err(e) = kill(child, sig) {
                    warn!("Failed to signal container process {child}: {e}");
                }
                forwarded = true;
            }
        }
    }
}

async fn reap(child: Pid) {
    match tokio::task::spawn_blocking(move || waitpid(child, None)).await {
        Ok(Ok(status)) => debug!("Container process {child} reaped: {status:?}"),
        Ok(Err(e)) => warn!("Failed to reap container process {child}: {e}"),
        Err(e) => warn!("Failed to reap container process {child}: {e}"),
    }
}

/// Create a new process with new namespaces, parked on `read_fd`.
fn new_container_process(
    read_fd: OwnedFd,
    write_fd: &OwnedFd,
    command: &[std::ffi::CString],
) -> anyhow::Result<Pid> {
    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC;

    const STACK_SIZE: usize = 1024 * 1024;
    let mut child_stack: Vec<u8> = vec![0; STACK_SIZE];

    let read_raw = read_fd.as_raw_fd();
    let write_raw = write_fd.as_raw_fd();

    let child_func = || -> isize {
        // Only the parent may hold the write end, or EOF never comes.
        let _ = close(write_raw);

        // Wait for cgroups and networking.
        let mut buffer = [0u8; 4];
        if read(read_raw, &mut buffer).is_err() {
            return -1;
        }

        match &buffer {
            b"CONT" => (),
            b"EXIT" => return 0,
            _ => return -1,
        }

        if let Err(e) = execvp(&command[0], command) {
            error!("Failed to exec {:?}: {e}", command[0]);
        }

        -1
    };

    // SAFETY: the child only reads a pipe and execs; everything it touches
    // was prepared before the clone.
    let child_pid = unsafe { clone(Box::new(child_func), &mut child_stack, flags, Some(SIGCHLD)) }?;
    drop(read_fd);

    Ok(child_pid)
}

fn setup_cgroup(cg_name: &str, child: Pid, memory: i64) -> anyhow::Result<()> {
    let hier = cgroups_rs::hierarchies::auto();
    let cg = CgroupBuilder::new(cg_name)
        .memory()
        .memory_hard_limit(memory)
        .done()
        .build(hier)
        .map_err(|e| anyhow::anyhow!("Failed to create cgroup {cg_name}: {e}"))?;

    if let Err(e) = cg.add_task_by_tgid(CgroupPid::from(child.as_raw() as u64)) {
        let _ = cg.delete();
        return Err(anyhow::anyhow!("Failed to add {child} to cgroup {cg_name}: {e}"));
    }

    Ok(())
}

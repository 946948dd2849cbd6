use std::ffi::CString;

use anyhow::Context;
use cgroups_rs::Cgroup;
use log::{error, warn};
use nix::sys::wait::WaitStatus;
use rand::{thread_rng, Rng};

use crate::core::{network::Networks, StatePaths};

mod exec;
mod list;
mod record;
mod rm;
mod run;
mod stop;

pub use exec::exec_container;
pub use list::list_containers;
pub use record::{ContainerRecord, ContainerStatus, Records};
pub use rm::remove_container;
pub use run::run_container;
pub use stop::stop_container;

/// What the networking core needs to know about a started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub pid: i32,
    pub name: String,
    /// `hostPort:containerPort` entries as given on the command line.
    pub port_mapping: Vec<String>,
}

fn random_id() -> String {
    let mut rng = thread_rng();
    let random_bytes: [u8; 16] = rng.gen();

    random_bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

fn to_cstrings(command: &[String]) -> anyhow::Result<Vec<CString>> {
    anyhow::ensure!(!command.is_empty(), "Empty command");

    command
        .iter()
        .map(|arg| CString::new(arg.as_str()).with_context(|| format!("Invalid argument {arg:?}")))
        .collect()
}

/// Undo the network attachment and cgroup a record holds.
///
/// An endpoint that could not be detached stays on the record so a later
/// `stop` or `rm` can retry.
async fn release_resources(record: &mut ContainerRecord, paths: &StatePaths) {
    if let Some(endpoint) = record.endpoint.take() {
        let result = match Networks::init(paths.clone()) {
            Ok(networks) => networks.disconnect(&endpoint).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Network of container {} is gone: {e}", record.name);
            }
            Err(e) => {
                error!("Failed to disconnect container {}: {e}", record.name);
                record.endpoint = Some(endpoint);
            }
        }
    }

    if let Some(cg_name) = record.cgroup.take() {
        let cg = Cgroup::load(cgroups_rs::hierarchies::auto(), cg_name.as_str());
        if let Err(e) = cg.delete() {
            error!("Failed to clean up cgroup of container {}: {e}", record.name);
        }
    }
}

/// Shell convention: the exit code, or 128 + signal number.
fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => -1,
    }
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;

pub mod cmd;
pub mod container;
pub mod error;
pub mod network;
mod store;

use cmd::{Commands, NetworkCommands};
use network::Networks;

pub const ROOT_PATH: &str = "/var/run/rtain";

/// Where the on-disk state of one root lives.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub ipam_file: PathBuf,
    pub ipam_lock: PathBuf,
    pub network_dir: PathBuf,
    pub network_lock: PathBuf,
    pub container_dir: PathBuf,
    pub container_lock: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let base = root.join("network");

        Self {
            ipam_file: base.join("ipam/subnet.json"),
            ipam_lock: base.join("ipam/subnet.json.lock"),
            network_dir: base.join("networks"),
            network_lock: base.join("networks.lock"),
            container_dir: root.join("containers"),
            container_lock: root.join("containers.lock"),
        }
    }
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::new(ROOT_PATH)
    }
}

/// Run one command to completion and return the process exit code.
///
/// `exec` never gets here: it has to join namespaces before any runtime
/// thread exists, see [`container::exec_container`].
pub async fn handle(root: &Path, command: Commands) -> anyhow::Result<i32> {
    let paths = StatePaths::new(root);
    debug!("Using state under {}", root.display());

    match command {
        Commands::Run(run_args) => container::run_container(run_args, paths).await,
        Commands::Exec(_) => anyhow::bail!("exec must be dispatched before the runtime starts"),
        Commands::PS(ps_args) => {
            print!("{}", container::list_containers(ps_args, &paths)?);
            Ok(0)
        }
        Commands::Stop(stop_args) => container::stop_container(stop_args, &paths).await,
        Commands::RM(rm_args) => container::remove_container(rm_args, &paths).await,
        Commands::Network(NetworkCommands::Create(args)) => {
            let mut networks = Networks::init(paths)?;
            networks
                .create_network(&args.driver, &args.subnet, &args.name)
                .await
                .with_context(|| format!("Failed to create network {}", args.name))?;
            Ok(0)
        }
        Commands::Network(NetworkCommands::List) => {
            let networks = Networks::init(paths)?;
            print!("{}", networks.list_networks());
            Ok(0)
        }
        Commands::Network(NetworkCommands::Remove(args)) => {
            let mut networks = Networks::init(paths)?;
            networks
                .delete_network(&args.name)
                .await
                .with_context(|| format!("Failed to remove network {}", args.name))?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = StatePaths::new("/tmp/root");

        assert_eq!(paths.ipam_file, PathBuf::from("/tmp/root/network/ipam/subnet.json"));
        assert_eq!(paths.network_dir, PathBuf::from("/tmp/root/network/networks"));
        assert_eq!(paths.network_lock, PathBuf::from("/tmp/root/network/networks.lock"));
        assert_eq!(paths.container_dir, PathBuf::from("/tmp/root/containers"));
        assert_eq!(StatePaths::default().network_dir, PathBuf::from("/var/run/rtain/network/networks"));
    }

    #[tokio::test]
    async fn test_handle_network_lifecycle_errors() {
        let dir = tempfile::TempDir::new().unwrap();

        let result = handle(
            dir.path(),
            Commands::Network(NetworkCommands::Remove(cmd::NetRemoveArgs {
                name: "nope".to_string(),
            })),
        )
        .await;
        assert!(result.is_err());

        let listed = handle(dir.path(), Commands::Network(NetworkCommands::List)).await;
        assert_eq!(listed.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handle_container_commands() {
        let dir = tempfile::TempDir::new().unwrap();

        let listed = handle(dir.path(), Commands::PS(cmd::PSArgs { all: true })).await;
        assert_eq!(listed.unwrap(), 0);

        let stopped = handle(
            dir.path(),
            Commands::Stop(cmd::StopArgs {
                name: "nope".to_string(),
                time: 1,
            }),
        )
        .await;
        assert!(stopped.is_err());

        let removed = handle(
            dir.path(),
            Commands::RM(cmd::RMArgs {
                name: "nope".to_string(),
                force: false,
            }),
        )
        .await;
        assert!(removed.is_err());
    }
}

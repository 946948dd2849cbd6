use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use nix::unistd::Pid;

use super::{
    release_resources,
    record::{ContainerStatus, Records},
    stop::terminate,
};
use crate::core::{cmd::RMArgs, StatePaths};

/// Grace period a forced removal gives the container.
const FORCE_GRACE: Duration = Duration::from_secs(1);

pub async fn remove_container(rm_args: RMArgs, paths: &StatePaths) -> anyhow::Result<i32> {
    let records = Records::new(paths);
    let mut record = records
        .get(&rm_args.name)
        .with_context(|| format!("Failed to remove container {}", rm_args.name))?;

    if record.observed_status() == ContainerStatus::Running {
        anyhow::ensure!(
            rm_args.force,
            "Container {} is still running, stop it first or use --force",
            record.name
        );
        terminate(Pid::from_raw(record.pid), FORCE_GRACE).await?;
    }

    release_resources(&mut record, paths).await;
    if let Some(endpoint) = &record.endpoint {
        warn!(
            "Container {} removed with address {} still held in network {}",
            record.name, endpoint.ip, endpoint.network
        );
    }

    records.deregister(&record.name)?;
    info!("Container {} removed", record.name);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::core::{
        container::ContainerRecord,
        network::{Endpoint, Network},
    };

    fn setup(record: &ContainerRecord) -> (TempDir, StatePaths) {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        Records::new(&paths).register(record).unwrap();
        (dir, paths)
    }

    fn args(name: &str, force: bool) -> RMArgs {
        RMArgs {
            name: name.to_string(),
            force,
        }
    }

    #[tokio::test]
    async fn test_remove_stopped_container() {
        let mut record = ContainerRecord::new("id", "c1", 0, vec![], vec![]);
        record.status = ContainerStatus::Stopped;
        let (_dir, paths) = setup(&record);

        assert_eq!(remove_container(args("c1", false), &paths).await.unwrap(), 0);
        assert!(Records::new(&paths).get("c1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_running_container_needs_force() {
        let record = ContainerRecord::new("id", "c1", std::process::id() as i32, vec![], vec![]);
        let (_dir, paths) = setup(&record);

        let err = remove_container(args("c1", false), &paths).await.unwrap_err();

        assert!(err.to_string().contains("still running"));
        assert_eq!(Records::new(&paths).get("c1").unwrap(), record);
    }

    #[tokio::test]
    async fn test_remove_exited_container() {
        // Recorded as running, but its process is long gone.
        let record = ContainerRecord::new("id", "c1", i32::MAX, vec![], vec![]);
        let (_dir, paths) = setup(&record);

        remove_container(args("c1", false), &paths).await.unwrap();
        assert!(Records::new(&paths).get("c1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_container_of_deleted_network() {
        let network = Network::new("gone", "10.9.0.1/24".parse().unwrap(), "bridge");
        let mut record = ContainerRecord::new("id", "c1", 0, vec![], vec![]);
        record.status = ContainerStatus::Stopped;
        record.endpoint = Some(Endpoint::new("id", &network, Ipv4Addr::new(10, 9, 0, 2), vec![]));
        let (_dir, paths) = setup(&record);

        remove_container(args("c1", false), &paths).await.unwrap();
        assert!(Records::new(&paths).list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_container() {
        let dir = TempDir::new().unwrap();

        let err = remove_container(args("nope", true), &StatePaths::new(dir.path()))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("nope"));
    }
}

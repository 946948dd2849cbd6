use std::{fs, path::PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::ContainerInfo;
use crate::core::{
    error::{NetError, Result},
    network::Endpoint,
    store, StatePaths,
};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    /// Recorded as running, but the process is gone.
    Exited,
}

/// What `rtain` remembers about a container between invocations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub pid: i32,
    pub command: Vec<String>,
    pub status: ContainerStatus,
    pub port_mapping: Vec<String>,
    /// Cgroup holding the container's limits, if any were set.
    pub cgroup: Option<String>,
    /// The network attachment still to be undone.
    pub endpoint: Option<Endpoint>,
}

impl ContainerRecord {
    pub fn new(id: &str, name: &str, pid: i32, command: Vec<String>, port_mapping: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            pid,
            command,
            status: ContainerStatus::Running,
            port_mapping,
            cgroup: None,
            endpoint: None,
        }
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            pid: self.pid,
            name: self.name.clone(),
            port_mapping: self.port_mapping.clone(),
        }
    }

    /// The recorded status, corrected for a process that died unnoticed.
    pub fn observed_status(&self) -> ContainerStatus {
        match self.status {
            ContainerStatus::Running if !process_alive(self.pid) => ContainerStatus::Exited,
            status => status,
        }
    }
}

/// Zombies count as gone.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// One JSON file per container under the container directory.
pub struct Records {
    dir: PathBuf,
    lock: PathBuf,
}

impl Records {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            dir: paths.container_dir.clone(),
            lock: paths.container_lock.clone(),
        }
    }

    /// Fails with `AlreadyExists` if the name is taken.
    pub fn register(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.path(&record.name)?;

        let _lock = store::lock_exclusive(&self.lock)?;
        if path.exists() {
            return Err(NetError::already_exists("container", &record.name));
        }

        store::write_json(&path, record)?;
        debug!("Registered container {}", record.name);
        Ok(())
    }

    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.path(&record.name)?;

        let _lock = store::lock_exclusive(&self.lock)?;
        store::write_json(&path, record)
    }

    pub fn get(&self, name: &str) -> Result<ContainerRecord> {
        store::read_json(&self.path(name)?)?.ok_or_else(|| NetError::not_found("container", name))
    }

    pub fn deregister(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;

        let _lock = store::lock_exclusive(&self.lock)?;
        store::remove(&path)?;
        debug!("Deregistered container {name}");
        Ok(())
    }

    /// All records, sorted by name. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NetError::persistence("failed to read directory", &self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| NetError::persistence("failed to read directory", &self.dir, e))?
                .path();
            if store::is_hidden(&path) || !path.is_file() {
                continue;
            }

            match store::read_json::<ContainerRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping container record {}: {e}", path.display()),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\0']) {
        return Err(NetError::invalid(format!("container name {name:?} is not allowed")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn record(name: &str, pid: i32) -> ContainerRecord {
        ContainerRecord::new("0123456789ab", name, pid, vec!["sh".to_string()], vec![])
    }

    #[test]
    fn test_register_and_get() {
        let dir = TempDir::new().unwrap();
        let records = Records::new(&StatePaths::new(dir.path()));

        let mut c1 = record("c1", 42);
        c1.cgroup = Some("c1-0123456789ab".to_string());
        records.register(&c1).unwrap();

        assert_eq!(records.get("c1").unwrap(), c1);
        assert!(dir.path().join("containers/c1").is_file());
    }

    #[test]
    fn test_register_duplicate() {
        let dir = TempDir::new().unwrap();
        let records = Records::new(&StatePaths::new(dir.path()));

        records.register(&record("c1", 42)).unwrap();
        let err = records.register(&record("c1", 43)).unwrap_err();

        assert!(matches!(err, NetError::AlreadyExists { kind: "container", .. }));
        assert_eq!(records.get("c1").unwrap().pid, 42);
    }

    #[test]
    fn test_missing_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let records = Records::new(&StatePaths::new(dir.path()));

        assert!(records.get("nope").unwrap_err().is_not_found());
        for name in ["", ".hidden", "../c1"] {
            assert!(matches!(
                records.get(name).unwrap_err(),
                NetError::InvalidArgument { .. }
            ));
        }
    }

    #[test]
    fn test_save_and_deregister() {
        let dir = TempDir::new().unwrap();
        let records = Records::new(&StatePaths::new(dir.path()));

        let mut c1 = record("c1", 42);
        records.register(&c1).unwrap();
        c1.status = ContainerStatus::Stopped;
        records.save(&c1).unwrap();
        assert_eq!(records.get("c1").unwrap().status, ContainerStatus::Stopped);

        records.deregister("c1").unwrap();
        assert!(records.get("c1").unwrap_err().is_not_found());
        assert!(records.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_sorted_and_skips_foreign_entries() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let records = Records::new(&paths);

        assert!(records.list().unwrap().is_empty());

        records.register(&record("zeta", 1)).unwrap();
        records.register(&record("alpha", 2)).unwrap();
        fs::write(paths.container_dir.join("broken"), "{").unwrap();
        fs::write(paths.container_dir.join(".c1.9.tmp"), "{").unwrap();

        let names: Vec<_> = records.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_observed_status() {
        let alive = record("c1", std::process::id() as i32);
        assert_eq!(alive.observed_status(), ContainerStatus::Running);

        let dead = record("c2", i32::MAX);
        assert_eq!(dead.observed_status(), ContainerStatus::Exited);

        let mut stopped = record("c3", 0);
        stopped.status = ContainerStatus::Stopped;
        assert_eq!(stopped.observed_status(), ContainerStatus::Stopped);
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
        assert!(!process_alive(i32::MAX));
    }
}

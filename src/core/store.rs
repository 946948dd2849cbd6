//! On-disk state shared between independent `rtain` processes.
//!
//! There is no resident daemon, so every mutation of shared state follows the
//! same cycle: take an exclusive `flock` on a sidecar lock file, load, mutate,
//! write the result to a hidden temporary file and `rename` it into place.
//! The lock is released when the returned [`Flock`] is dropped (or the
//! process dies).

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::debug;
use nix::fcntl::{Flock, FlockArg};
use serde::{de::DeserializeOwned, Serialize};

use super::error::{NetError, Result};

/// Block until the exclusive lock on `path` is held.
pub fn lock_exclusive(path: &Path) -> Result<Flock<File>> {
    ensure_parent(path)?;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| NetError::persistence("failed to open lock file", path, e))?;

    debug!("Waiting for lock {}", path.display());
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| NetError::persistence("failed to acquire lock", path, errno))
}

/// Read a JSON document, `None` when the file does not exist yet.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(NetError::persistence("failed to read", path, e)),
    };

    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| NetError::persistence("failed to parse", path, e))
}

/// Replace `path` with the JSON encoding of `value` in one rename.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;

    let contents =
        serde_json::to_vec(value).map_err(|e| NetError::persistence("failed to encode", path, e))?;

    let tmp_path = temp_path_for(path);
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        NetError::persistence("failed to write", path, e)
    })
}

pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NetError::persistence("failed to remove", path, e)),
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| NetError::persistence("failed to create directory", dir, e))
}

/// Files starting with a dot are temporaries or locks, never records.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'))
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

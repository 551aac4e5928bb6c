use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use super::StoreError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A lock file with no readable holder is only broken once it is this old.
const UNOWNED_STALE_AFTER: Duration = Duration::from_secs(30);

/// Exclusive advisory lock held by the existence of a lock file.
///
/// The file is created with `create_new`, holds the pid of its owner, and is
/// removed on drop. A lock left behind by a process that no longer runs is
/// broken by the next caller.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(path = %path.display(), "acquired lock");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if break_if_stale(&path)? {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        warn!(path = %path.display(), "lock acquisition timed out");
                        return Err(StoreError::LockTimeout(path));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

/// Removes the lock file at `path` if its holder is gone.
///
/// Returns true when the file was removed, or had already disappeared.
fn break_if_stale(path: &Path) -> Result<bool, StoreError> {
    let holder = read_holder(path);
    let stale = match holder {
        Some(pid) => !process_alive(pid),
        None => age(path).is_some_and(|age| age >= UNOWNED_STALE_AFTER),
    };
    if !stale {
        return Ok(false);
    }
    // Another waiter may have broken the lock and taken it in between.
    if read_holder(path) != holder {
        return Ok(false);
    }

    match fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), pid = ?holder, "broke stale lock");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err.into()),
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Above the largest pid any supported platform hands out
    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.lock");

        let held = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));
        let second = FileLock::acquire(&path, Duration::from_millis(60));
        assert!(matches!(second, Err(StoreError::LockTimeout(_))));

        drop(held);
        assert!(!path.exists());
        FileLock::acquire(&path, Duration::from_millis(60)).unwrap();
    }

    #[test]
    fn test_lock_of_dead_process_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.lock");
        fs::write(&path, format!("{DEAD_PID}\n")).unwrap();

        let lock = FileLock::acquire(&path, Duration::from_millis(60)).unwrap();
        assert_eq!(read_holder(lock.path()), Some(std::process::id()));
    }

    #[test]
    fn test_fresh_lock_without_holder_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.lock");
        fs::write(&path, "").unwrap();

        let attempt = FileLock::acquire(&path, Duration::from_millis(60));
        assert!(matches!(attempt, Err(StoreError::LockTimeout(_))));
        assert!(path.exists());
    }
}

//! C2: advisory exclusive file lock with stale-lock recovery and atomic
//! writes. Synchronous by design — callers inside an async context (the
//! bridge daemon) run it via `tokio::task::spawn_blocking`, the same way
//! blocking keychain I/O is kept off the event loop.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::McpcError;
use crate::paths::pid_is_alive;

const LOCK_DEADLINE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Acquire an exclusive lock on `path`, seeding it with `default_content`
/// if it does not exist yet, then run `f` with the file's current bytes.
/// `f` returns the new bytes to persist, or `None` to leave the file
/// untouched. The body runs to completion — including on panic, via a drop
/// guard — before the lock is released.
pub fn with_lock<F>(path: &Path, default_content: &[u8], f: F) -> Result<(), McpcError>
where
    F: FnOnce(Vec<u8>) -> Result<Option<Vec<u8>>, McpcError>,
{
    let lock_path = lock_file_path(path);
    let _guard = acquire(&lock_path)?;

    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(McpcError::io)?;
        }
        write_with_perms(path, default_content)?;
    }

    let current = fs::read(path).map_err(McpcError::io)?;
    if let Some(next) = f(current)? {
        atomic_write(path, &next)?;
    }
    Ok(())
}

fn lock_file_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire(lock_path: &Path) -> Result<LockGuard, McpcError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(McpcError::io)?;
    }
    let deadline = Instant::now() + LOCK_DEADLINE;
    loop {
        match create_exclusive(lock_path) {
            Ok(()) => return Ok(LockGuard { path: lock_path.to_path_buf() }),
            Err(_) => {
                if let Some(owner_pid) = read_owner_pid(lock_path) {
                    if !pid_is_alive(owner_pid) {
                        // Stale lock: owning process is gone, break it.
                        let _ = fs::remove_file(lock_path);
                        continue;
                    }
                } else {
                    // Unreadable/empty lock file: treat as stale.
                    let _ = fs::remove_file(lock_path);
                    continue;
                }
                if Instant::now() >= deadline {
                    return Err(McpcError::Client(format!(
                        "timed out waiting for lock on {}",
                        lock_path.display()
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

#[cfg(unix)]
fn create_exclusive(lock_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(lock_path)?;
    write!(f, "{}", std::process::id())
}

#[cfg(not(unix))]
fn create_exclusive(lock_path: &Path) -> std::io::Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    write!(f, "{}", std::process::id())
}

fn read_owner_pid(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

fn write_with_perms(path: &Path, content: &[u8]) -> Result<(), McpcError> {
    atomic_write(path, content)
}

/// Write to a unique temp file in the same directory, fsync, then rename
/// over the target. Never write partial JSON over a live file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), McpcError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(McpcError::io)?;
    let tmp_name = format!(
        ".{}.{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("mcpc"),
        std::process::id(),
        uuid::Uuid::new_v4()
    );
    let tmp_path = dir.join(tmp_name);

    {
        let mut f = open_with_owner_perms(&tmp_path)?;
        f.write_all(content).map_err(McpcError::io)?;
        f.sync_all().map_err(McpcError::io)?;
    }
    fs::rename(&tmp_path, path).map_err(McpcError::io)?;
    Ok(())
}

#[cfg(unix)]
fn open_with_owner_perms(path: &Path) -> Result<fs::File, McpcError> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(McpcError::io)
}

#[cfg(not(unix))]
fn open_with_owner_perms(path: &Path) -> Result<fs::File, McpcError> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(McpcError::io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::TempPathProvider;

    fn tmp_file(tag: &str) -> PathBuf {
        let pp = TempPathProvider::new(tag);
        pp.base.join("data.json")
    }

    #[test]
    fn seeds_default_content_on_first_use() {
        let path = tmp_file("lock-seed");
        with_lock(&path, b"{}", |bytes| Ok(None)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn writes_inside_closure_are_atomic_and_persisted() {
        let path = tmp_file("lock-write");
        with_lock(&path, b"{}", |_| Ok(Some(b"{\"a\":1}".to_vec()))).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn stale_lock_from_dead_pid_is_broken() {
        let path = tmp_file("lock-stale");
        let lock_path = lock_file_path(&path);
        fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        fs::write(&lock_path, (u32::MAX - 1).to_string()).unwrap();
        // Should succeed promptly despite the pre-existing (stale) lock file.
        let start = Instant::now();
        with_lock(&path, b"{}", |_| Ok(None)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn lock_file_removed_after_release() {
        let path = tmp_file("lock-release");
        with_lock(&path, b"{}", |_| Ok(None)).unwrap();
        assert!(!lock_file_path(&path).exists());
    }
}

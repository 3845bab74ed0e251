/// Single-instance guard backed by an exclusively created marker file.
///
/// The marker records the owner's PID.  A marker whose owner is gone (or whose
/// PID now belongs to a different program, or that cannot be parsed) is stale and
/// is reclaimed, so a crashed instance never blocks a relaunch.
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("failed to take instance marker {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    pid: u32,
    /// RFC 3339; informational only.
    started: String,
}

/// Held for the lifetime of the process.  Dropping it releases the marker.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl InstanceLock {
    /// Takes the marker at `path`, reclaiming it if it is stale.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source: io::Error| LockError::Io { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let pid = std::process::id();
        let mut reclaimed = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let marker = Marker { pid, started: chrono::Local::now().to_rfc3339() };
                    let content = toml::to_string(&marker).unwrap_or_else(|_| format!("pid = {pid}\n"));
                    file.write_all(content.as_bytes()).map_err(io_err)?;
                    info!(path = %path.display(), pid, "instance lock acquired");
                    return Ok(Self { path: path.to_path_buf(), pid, released: false });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = read_owner(path);
                    if let Some(owner) = owner.filter(|p| is_instance_running(*p)) {
                        return Err(LockError::AlreadyRunning { pid: owner });
                    }
                    if reclaimed {
                        // Someone recreated the marker between our remove and create.
                        return Err(io_err(e));
                    }
                    warn!(path = %path.display(), owner, "reclaiming stale instance marker");
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                    reclaimed = true;
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    /// Removes the marker if it still names this process.  Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if read_owner(&self.path) != Some(self.pid) {
            debug!(path = %self.path.display(), "instance marker no longer ours; leaving it");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "instance lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove instance marker"),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    toml::from_str::<Marker>(&content).ok().map(|m| m.pid)
}

/// `true` if `pid` is alive and runs this program.
///
/// Names are compared by prefix because some platforms truncate process names
/// (Linux keeps 15 characters).
fn is_instance_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let Some(process) = sys.process(pid) else {
        return false;
    };
    let Some(own) = own_executable_name() else {
        return true;
    };
    let name = process.name().to_string_lossy().to_lowercase();
    !name.is_empty() && own.starts_with(&name)
}

fn own_executable_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_name()?.to_string_lossy().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Far above any real pid_max, so never a live process.
    const DEAD_PID: u32 = u32::MAX - 1;

    fn marker_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pawgate.lock");
        (dir, path)
    }

    #[test]
    fn acquire_writes_own_pid() {
        let (_dir, path) = marker_path();
        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[test]
    fn acquire_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PawGate").join("pawgate.lock");
        let _lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn second_acquire_reports_running_instance() {
        let (_dir, path) = marker_path();
        let _first = InstanceLock::acquire(&path).unwrap();

        match InstanceLock::acquire(&path) {
            Err(LockError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        // The holder's marker is untouched.
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[test]
    fn marker_of_dead_process_is_reclaimed() {
        let (_dir, path) = marker_path();
        fs::write(&path, format!("pid = {DEAD_PID}\nstarted = \"2024-01-01T00:00:00Z\"\n")).unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[test]
    fn garbage_marker_is_reclaimed() {
        let (_dir, path) = marker_path();
        fs::write(&path, "\u{0}\u{1}not a marker").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn marker_naming_unrelated_live_process_is_reclaimed() {
        let (_dir, path) = marker_path();
        // PID 1 is alive but is never this test binary.
        fs::write(&path, "pid = 1\nstarted = \"2024-01-01T00:00:00Z\"\n").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, path) = marker_path();
        let mut lock = InstanceLock::acquire(&path).unwrap();
        lock.release();
        assert!(!path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn drop_releases_marker() {
        let (_dir, path) = marker_path();
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        let _again = InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn release_leaves_foreign_marker_alone() {
        let (_dir, path) = marker_path();
        let mut lock = InstanceLock::acquire(&path).unwrap();
        fs::write(&path, format!("pid = {DEAD_PID}\nstarted = \"x\"\n")).unwrap();

        lock.release();
        assert!(path.exists());
    }
}

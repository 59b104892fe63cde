//! Liveness checks and the on-disk pid table (`pids/<id>.pid`).

use std::path::{Path, PathBuf};

use crate::error::QvmError;
use crate::util;

/// Whether `pid` names a running process.
///
/// Signal 0 probes existence without delivering anything. On Linux a zombie
/// still answers signal 0, so `/proc/<pid>/stat` is checked as well.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    if unsafe { libc::kill(raw, 0) } != 0 {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name is parenthesized and may itself contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send SIGTERM.
pub fn terminate(pid: u32) -> std::io::Result<()> {
    signal(pid, libc::SIGTERM)
}

/// Send SIGKILL.
pub fn kill(pid: u32) -> std::io::Result<()> {
    signal(pid, libc::SIGKILL)
}

fn signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::kill(raw, sig) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Identity → pid markers.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    dir: PathBuf,
}

impl ProcessTable {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id}.pid"))
    }

    pub fn exists(&self, id: u32) -> bool {
        self.path(id).exists()
    }

    /// Recorded pid. `None` when the marker is missing or unreadable.
    pub fn read(&self, id: u32) -> Option<u32> {
        std::fs::read_to_string(self.path(id))
            .ok()?
            .trim()
            .parse()
            .ok()
            .filter(|pid| *pid > 0)
    }

    pub fn write(&self, id: u32, pid: u32) -> Result<(), QvmError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| QvmError::Io {
            context: format!("creating {}", self.dir.display()),
            source: e,
        })?;
        let path = self.path(id);
        std::fs::write(&path, pid.to_string()).map_err(|e| QvmError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
    }

    pub fn remove(&self, id: u32) -> Result<bool, QvmError> {
        util::remove_if_exists(&self.path(id))
    }

    /// Recorded pid, but only if that process is still alive.
    pub fn live_pid(&self, id: u32) -> Option<u32> {
        self.read(id).filter(|pid| is_alive(*pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn exited_child_is_dead_after_wait() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn zombie_counts_as_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Give it time to exit without reaping it.
        for _ in 0..100 {
            if is_zombie(pid) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!is_alive(pid));
        child.wait().unwrap();
    }

    #[test]
    fn table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let table = ProcessTable::new(dir.path().join("pids"));
        assert_eq!(table.read(150), None);
        table.write(150, 4242).unwrap();
        assert!(table.exists(150));
        assert_eq!(table.read(150), Some(4242));
        assert!(table.remove(150).unwrap());
        assert!(!table.remove(150).unwrap());
    }

    #[test]
    fn corrupt_marker_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let table = ProcessTable::new(dir.path());
        std::fs::write(dir.path().join("150.pid"), "not-a-pid").unwrap();
        assert!(table.exists(150));
        assert_eq!(table.read(150), None);
        assert_eq!(table.live_pid(150), None);
    }

    #[test]
    fn live_pid_filters_dead_processes() {
        let dir = tempfile::tempdir().unwrap();
        let table = ProcessTable::new(dir.path());
        table.write(1, std::process::id()).unwrap();
        assert_eq!(table.live_pid(1), Some(std::process::id()));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        table.write(2, pid).unwrap();
        assert_eq!(table.live_pid(2), None);
    }
}

//! PID file tracking the running daemon.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// What a PID file says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Running(u32),
    /// File names a process that is gone
    Stale(u32),
    Absent,
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `fleet-scheduler/daemon.pid` under the runtime dir, else the cache dir.
    pub fn default_location() -> Self {
        let base = directories::BaseDirs::new()
            .and_then(|dirs| {
                dirs.runtime_dir()
                    .map(Path::to_path_buf)
                    .or_else(|| Some(dirs.cache_dir().to_path_buf()))
            })
            .unwrap_or_else(std::env::temp_dir);
        Self::at(base.join("fleet-scheduler").join("daemon.pid"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
    }

    pub fn state(&self) -> DaemonState {
        match self.read() {
            Some(pid) if process_alive(pid) => DaemonState::Running(pid),
            Some(pid) => DaemonState::Stale(pid),
            None => DaemonState::Absent,
        }
    }

    /// Record this process, refusing while another live daemon holds the file.
    pub fn claim(&self) -> io::Result<()> {
        if let DaemonState::Running(pid) = self.state() {
            if pid != std::process::id() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("daemon already running with PID {}", pid),
                ));
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, std::process::id().to_string())?;
        debug!(path = %self.path.display(), "Wrote PID file");
        Ok(())
    }

    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed PID file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove PID file"),
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence; EPERM means it exists under another user
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Ask `pid` to shut down gracefully.
#[cfg(unix)]
pub fn request_termination(pid: u32) -> io::Result<()> {
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn request_termination(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "stopping the daemon is only supported on Unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_location() {
        let pid_file = PidFile::default_location();
        assert!(pid_file.path().ends_with("fleet-scheduler/daemon.pid"));
    }

    #[test]
    fn test_claim_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::at(dir.path().join("nested").join("daemon.pid"));
        assert_eq!(pid_file.state(), DaemonState::Absent);

        pid_file.claim().unwrap();
        assert_eq!(pid_file.read(), Some(std::process::id()));

        // Claiming again from the same process is fine
        pid_file.claim().unwrap();

        pid_file.remove();
        assert!(!pid_file.path().exists());
        pid_file.remove();
    }

    #[cfg(unix)]
    #[test]
    fn test_live_and_stale_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let pid_file = PidFile::at(&path);

        fs::write(&path, std::process::id().to_string()).unwrap();
        assert_eq!(pid_file.state(), DaemonState::Running(std::process::id()));

        // Above the Linux pid_max ceiling, so never a live process
        fs::write(&path, "4194305").unwrap();
        assert_eq!(pid_file.state(), DaemonState::Stale(4_194_305));
        pid_file.claim().unwrap();

        fs::write(&path, "garbage").unwrap();
        assert_eq!(pid_file.state(), DaemonState::Absent);
    }

    #[cfg(unix)]
    #[test]
    fn test_claim_refused_while_other_daemon_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // PID 1 always exists
        fs::write(&path, "1").unwrap();

        let pid_file = PidFile::at(&path);
        assert_eq!(pid_file.state(), DaemonState::Running(1));
        let err = pid_file.claim().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(pid_file.read(), Some(1));
    }
}

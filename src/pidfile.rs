//! PID-file handling for the server daemon.
//!
//! The file is created exclusively so two daemons cannot coexist. A file
//! left behind by a dead process is replaced with a warning; an
//! unwritable location warns and continues without one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates the PID file exclusively. An empty path disables PID-file
    /// handling. Returns `None` when no file is managed.
    pub fn create(path: &Path) -> Result<Option<PidFile>> {
        if path.as_os_str().is_empty() {
            return Ok(None);
        }

        match write_exclusive(path) {
            Ok(()) => Ok(Some(PidFile {
                path: path.to_path_buf(),
            })),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(pid) = recorded_pid(path) {
                    if process_alive(pid) {
                        bail!(
                            "PID file {} belongs to running process {pid}",
                            path.display()
                        );
                    }
                }

                warn!("replacing orphaned PID file {}", path.display());
                fs::remove_file(path)
                    .with_context(|| format!("failed to remove orphaned PID file {}", path.display()))?;
                write_exclusive(path)
                    .with_context(|| format!("failed to create PID file {}", path.display()))?;

                Ok(Some(PidFile {
                    path: path.to_path_buf(),
                }))
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
                ) =>
            {
                warn!("unable to write PID file {}: {error}", path.display());
                Ok(None)
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to create PID file {}", path.display()))
            }
        }
    }

    /// Removes the PID file; failure is a warning.
    pub fn remove(self) {
        if let Err(error) = fs::remove_file(&self.path) {
            warn!("failed to remove pidfile {}: {error}", self.path.display());
        }
    }
}

fn write_exclusive(path: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;

    writeln!(file, "{}", std::process::id())
}

fn recorded_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_the_current_pid() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("k8pshd.pid");

        let pid_file = PidFile::create(&path).unwrap().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));

        pid_file.remove();
        assert!(!path.exists());
    }

    #[test]
    fn empty_path_disables_the_pid_file() {
        assert!(PidFile::create(Path::new("")).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn refuses_a_live_pid() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("k8pshd.pid");

        // Our own PID is certainly alive.
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(PidFile::create(&path).is_err());
    }

    #[test]
    fn replaces_an_orphaned_pid_file() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("k8pshd.pid");

        fs::write(&path, "not-a-pid\n").unwrap();

        let pid_file = PidFile::create(&path).unwrap().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));
        pid_file.remove();
    }
}

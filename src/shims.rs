//! Per-command client executables (shims).
//!
//! A shim is a file named exactly after a command; invoking it dispatches
//! through the client code path with the basename as the command name.
//! Symbolic links are preferred, falling back to hard links and finally
//! to a copy of the current executable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::Configuration;

pub struct ShimSettings<'a> {
    pub server_name: &'a str,
    pub directory: &'a Path,
    pub disable: bool,
    pub generate_local: bool,
    pub overwrite: bool,
}

/// The shims one server run created, recorded so a clean shutdown can
/// delete them.
pub struct ShimSet {
    created: Vec<PathBuf>,
}

/// Creates a shim for every command that targets another host (or every
/// command with `generate_local`). Stale files are deleted first when
/// shims are disabled or overwriting is requested.
pub fn create_client_shims(
    configuration: &Configuration,
    settings: &ShimSettings<'_>,
) -> Result<ShimSet> {
    let target =
        std::env::current_exe().context("failed to determine the current executable path")?;
    let mut created = Vec::new();

    for command in configuration.commands().values() {
        let filename = settings.directory.join(shim_name(&command.name));

        if settings.disable || settings.overwrite {
            match fs::remove_file(&filename) {
                Ok(()) => debug!("deleted stale client executable {}", filename.display()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(
                        "failed to delete stale client executable {}: {error}",
                        filename.display()
                    );
                }
            }
        }

        let host = configuration.host(command.host);

        if !settings.disable && (settings.generate_local || host.hostname != settings.server_name) {
            link_or_copy(&target, &filename).with_context(|| {
                format!("failed to create client executable for command {}", command.name)
            })?;
            debug!("created client executable {}", filename.display());
            created.push(filename);
        }
    }

    Ok(ShimSet { created })
}

impl ShimSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Deletes the created shims; failures are warnings, not errors.
    pub fn remove(self) {
        for path in &self.created {
            if let Err(error) = fs::remove_file(path) {
                warn!("failed to remove client executable {}: {error}", path.display());
            }
        }
    }
}

fn shim_name(command: &str) -> String {
    if cfg!(windows) {
        format!("{command}.exe")
    } else {
        command.to_string()
    }
}

fn link_or_copy(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    match std::os::unix::fs::symlink(target, link) {
        Ok(()) => return Ok(()),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => return Err(error),
        Err(_) => {}
    }

    match fs::hard_link(target, link) {
        Ok(()) => return Ok(()),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => return Err(error),
        Err(_) => {}
    }

    // Reserve the name exclusively, then copy the executable over it.
    fs::OpenOptions::new().write(true).create_new(true).open(link)?;
    fs::copy(target, link).map(|_| ())
}

use crate::error::SupervisorError;
use chrono::Utc;
use crate::control::{process_identity, Identity};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};


/*
    @@@
    @InstanceGuard;
    . Pid file `<run_dir>/<service>.pid` holding the host pid and its start time.
    . acquire() fails with AlreadyRunning only when the recorded pid is alive and runs the supervisor executable; anything else is stale and replaced.
    . The file is created exclusively, so two hosts racing past the stale check cannot both win.
    . The file is removed again when the guard drops.
*/
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    pub fn acquire(run_dir: &Path, service: &str) -> Result<Self, SupervisorError> {
        Self::acquire_as(run_dir, service, &own_process_name())
    }

    /// Like `acquire`, with the executable name a live holder must carry.
    pub fn acquire_as(run_dir: &Path, service: &str, supervisor_name: &str) -> Result<Self, SupervisorError> {
        fs::create_dir_all(run_dir).map_err(|e| {
            SupervisorError::Config(format!("cannot create {}: {}", run_dir.display(), e))
        })?;
        let path = run_dir.join(format!("{}.pid", service));
        let current = std::process::id();

        if path.exists() {
            match read_pid(&path) {
                Some(pid) if pid != current => match process_identity(pid, supervisor_name) {
                    Identity::Matches => {
                        return Err(SupervisorError::AlreadyRunning { service: service.to_string(), pid });
                    }
                    Identity::Mismatch(actual) => {
                        warn!(service, pid, actual = %actual, path = %path.display(), "Pid reused by another program; replacing pid file");
                    }
                    Identity::Missing => {
                        warn!(service, pid, path = %path.display(), "Replacing stale pid file");
                    }
                },
                Some(_) => {}
                None => warn!(service, path = %path.display(), "Replacing unreadable pid file"),
            }
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(SupervisorError::Config(format!("cannot remove {}: {}", path.display(), e)));
                }
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let pid = read_pid(&path).unwrap_or(0);
                return Err(SupervisorError::AlreadyRunning { service: service.to_string(), pid });
            }
            Err(e) => {
                return Err(SupervisorError::Config(format!("cannot create {}: {}", path.display(), e)));
            }
        };
        // Owned from here on, so a failed write still removes the file.
        let guard = Self { path };
        write!(file, "{}\n{}\n", current, Utc::now().to_rfc3339()).map_err(|e| {
            SupervisorError::Config(format!("cannot write {}: {}", guard.path.display(), e))
        })?;
        info!(service, pid = current, path = %guard.path.display(), "Pid file written");

        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().next()?.trim().parse().ok()
}

fn own_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

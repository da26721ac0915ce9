//! Filesystem locations used by the worker-tier processes: the runtime
//! directory holding PID files and singleton-check sockets, and the log
//! directory used by [`crate::logging`].

use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;

/// Resolved filesystem paths for one process role (e.g. `"job-processor"`
/// or `"keepalive-service"`).
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
    role: String,
}

impl Paths {
    /// Resolve paths under `~/.dealer-worker/` (or `$DEALER_WORKER_HOME` if
    /// set) for the given process role.
    pub fn for_role(role: &str) -> CoreResult<Self> {
        let root = match std::env::var("DEALER_WORKER_HOME") {
            Ok(value) => PathBuf::from(value),
            Err(_) => dirs::home_dir()
                .ok_or(CoreError::NoHomeDir)?
                .join(".dealer-worker"),
        };
        Ok(Self {
            root,
            role: role.to_string(),
        })
    }

    pub fn ensure_all(&self) -> CoreResult<()> {
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(self.run_dir())?;
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(format!("{}.jsonl", self.role))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join(format!("{}.pid", self.role))
    }

    pub fn socket_file(&self) -> PathBuf {
        self.run_dir().join(format!("{}.sock", self.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_scoped_by_role() {
        std::env::set_var("DEALER_WORKER_HOME", "/tmp/dealer-worker-test-home");
        let paths = Paths::for_role("job-processor").unwrap();
        assert!(paths.pid_file().ends_with("job-processor.pid"));
        assert!(paths.socket_file().ends_with("job-processor.sock"));
        assert!(paths.log_file().ends_with("job-processor.jsonl"));
        std::env::remove_var("DEALER_WORKER_HOME");
    }
}

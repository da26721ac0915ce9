//! Logging initialization for the worker-tier processes.
//!
//! Thin wrapper over [`observability`] so every process in this workspace
//! bootstraps logging the same way: structured JSONL to a shared log file,
//! with an optional stderr mirror for interactive runs.

use crate::paths::Paths;
use observability::LogConfig;

/// Initialize structured logging for a process with the given role name
/// (e.g. `"job-processor"`, `"keepalive-service"`). `also_stderr` mirrors
/// output to the console, useful when running interactively rather than
/// under a process supervisor.
pub fn init_logging(role: &str, level: &str, also_stderr: bool) {
    let log_path = Paths::for_role(role)
        .ok()
        .map(|paths| paths.log_file());

    observability::init_with_config(LogConfig {
        service_name: role.to_string(),
        default_level: level.to_string(),
        log_path,
        also_stderr,
    });
}

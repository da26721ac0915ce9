//! Shared configuration, error taxonomy, logging bootstrap, and filesystem
//! paths for the worker-tier processes.

mod config;
mod error;
mod logging;
mod paths;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;

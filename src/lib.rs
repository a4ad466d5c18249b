/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod parse;
pub mod error;
pub mod output;
pub mod source;
pub mod readiness;
pub mod classify;
pub mod router;
pub mod monitor;
pub mod runtime;
pub mod control;
pub mod instance;
pub mod host;
pub mod logger;
#[cfg(windows)]
pub mod service;

pub use error::SupervisorError;
pub use host::RunMode;
pub use runtime::{ProcessSupervisor, SupervisorParts};

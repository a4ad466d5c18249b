use thiserror::Error;

use crate::readiness::FaultKind;

/// Failures surfaced by the supervisor.
///
/// Readiness-phase failures come back as the result of `start()`. Failed
/// signal dispatch is not an error; dispatchers return `false` instead.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("the {service} process could not start within the allotted window: {detail}")]
    ReadinessTimeout {
        service: String,
        detail: String,
        lines: usize,
    },

    #[error("{}", fault_message(.kind, .message))]
    ReadinessFault {
        kind: FaultKind,
        message: String,
    },

    #[error("failed to launch `{cmd}`: {source}")]
    ProcessLaunch {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service} is already running (pid {pid})")]
    AlreadyRunning {
        service: String,
        pid: u32,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("supervisor for {0} has already been started")]
    AlreadyStarted(String),
}

fn fault_message(kind: &FaultKind, message: &str) -> String {
    match kind {
        FaultKind::Generic => format!("process faulted during startup: {}", message),
        FaultKind::StartupFault => format!("process reported a startup failure: {}", message),
    }
}

impl SupervisorError {
    /// Exit code the host reports when no child exit code is available.
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// True when the failure points at configuration the operator can fix.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            SupervisorError::ReadinessFault { kind: FaultKind::StartupFault, .. }
                | SupervisorError::Config(_)
                | SupervisorError::AlreadyRunning { .. }
        )
    }
}

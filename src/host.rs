use crate::control::{platform_dispatcher, NoopDispatcher, SignalDispatcher, SignalRegistry};
use crate::error::SupervisorError;
use crate::instance::InstanceGuard;
use crate::parse::SupervisorConfig;
use crate::router::{ConsoleSink, LogHandler, OutputRouter};
use crate::runtime::{ProcessSupervisor, SupervisorParts};
use crate::source::{CommandLauncher, ProcessLauncher};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Foreground: console echo, stop on Ctrl-C.
    Interactive,
    /// Run by a service manager: no console echo.
    Managed,
}

impl RunMode {
    pub fn detect(force_managed: bool) -> Self {
        if !force_managed && std::io::stdout().is_terminal() {
            RunMode::Interactive
        } else {
            RunMode::Managed
        }
    }

    pub fn is_interactive(self) -> bool {
        self == RunMode::Interactive
    }
}

/// Builds the supervisor the host runs: real launcher, platform dispatcher,
/// startup lines to the operational log, console echo as the writer.
pub fn build_supervisor(
    config: SupervisorConfig,
    mode: RunMode,
    launcher: Arc<dyn ProcessLauncher>,
) -> ProcessSupervisor {
    build_supervisor_with(config, mode, launcher, SignalRegistry::new())
}

/// As `build_supervisor`, with a registry someone else can trigger too.
pub fn build_supervisor_with(
    config: SupervisorConfig,
    mode: RunMode,
    launcher: Arc<dyn ProcessLauncher>,
    registry: SignalRegistry,
) -> ProcessSupervisor {
    let dispatcher: Arc<dyn SignalDispatcher> = if config.stop.graceful {
        platform_dispatcher()
    } else {
        Arc::new(NoopDispatcher)
    };
    let router = OutputRouter::new(
        Box::new(LogHandler::new(config.service.name.clone())),
        Box::new(ConsoleSink::new(config.service.name.clone())),
        mode,
    );
    let mut parts = SupervisorParts::from_config(&config, launcher, dispatcher, router);
    parts.registry = registry;
    ProcessSupervisor::new(config, parts)
}

fn report_failure(mode: RunMode, err: &SupervisorError) {
    if mode.is_interactive() {
        eprintln!("error: {}", err);
    }
    if err.is_actionable() {
        error!(actionable = true, "{}", err);
    } else {
        error!("{}", err);
    }
}



/*
    @@@
    @run_service();
    . Managed mode refuses to start when another instance of the service is alive.
    . `registry` becomes the supervisor's shutdown switch, so outside hooks (the service control manager) can stop it.
    . Starts the supervisor; on readiness waits for a shutdown request or the child's own exit, then stops it.
    . Returns the child's last exit code, or 1 when a failure came before any exit code.
    . A failed start never reports 0, even when the child itself exited cleanly.
*/
pub async fn run_service(config: SupervisorConfig, mode: RunMode, registry: SignalRegistry) -> i32 {
    let _guard = if mode == RunMode::Managed {
        match InstanceGuard::acquire(Path::new(&config.logs.run_dir), &config.service.name) {
            Ok(guard) => Some(guard),
            Err(e) => {
                report_failure(mode, &e);
                return e.exit_code();
            }
        }
    } else {
        None
    };

    let supervisor = build_supervisor_with(config, mode, Arc::new(CommandLauncher), registry);
    run_supervisor(&supervisor, mode).await
}

pub async fn run_supervisor(supervisor: &ProcessSupervisor, mode: RunMode) -> i32 {
    let name = supervisor.config().service.name.clone();
    let listener = match supervisor.registry().listen_os_signals() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(service = %name, error = %e, "cannot listen for shutdown signals");
            None
        }
    };

    let code = match supervisor.start().await {
        Ok(()) => {
            info!(service = %name, pid = ?supervisor.pid(), "Service is up");
            if mode.is_interactive() {
                eprintln!("[{}] ready; press Ctrl-C to stop", name);
            }
            tokio::select! {
                _ = supervisor.registry().wait() => {
                    info!(service = %name, reason = ?supervisor.registry().reason(), "Shutting down");
                }
                code = supervisor.wait_exit() => {
                    warn!(service = %name, exit_code = ?code, "Service stopped on its own");
                }
            }
            supervisor.stop().await.unwrap_or(0)
        }
        Err(e) => {
            report_failure(mode, &e);
            let observed = supervisor.last_exit_code();
            supervisor.stop().await;
            match observed {
                Some(code) if code != 0 => code,
                _ => e.exit_code(),
            }
        }
    };

    if let Some(listener) = listener {
        listener.abort();
    }
    code
}

use crate::control::SignalRegistry;
use crate::host::{run_service, RunMode};
use crate::parse::SupervisorConfig;
use std::ffi::OsString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::{define_windows_service, service_dispatcher};

// Not running under the service control manager.
const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: i32 = 1063;

static CONFIG: OnceLock<Mutex<Option<SupervisorConfig>>> = OnceLock::new();
static EXIT_CODE: AtomicI32 = AtomicI32::new(1);

define_windows_service!(ffi_service_main, service_main);


/*
    @@@
    @run_managed();
    . Hands the process to the service control manager; service_main then runs the supervisor with a registry the Stop and Shutdown controls trigger.
    . Blocks until the service has stopped and returns the supervised exit code.
    . When the process was not started by the control manager, runs the supervisor directly instead.
*/
pub fn run_managed(config: SupervisorConfig) -> i32 {
    let name = config.service.name.clone();
    let slot = CONFIG.get_or_init(|| Mutex::new(None));
    match slot.lock() {
        Ok(mut slot) => *slot = Some(config),
        Err(poisoned) => *poisoned.into_inner() = Some(config),
    }

    match service_dispatcher::start(&name, ffi_service_main) {
        Ok(()) => EXIT_CODE.load(Ordering::SeqCst),
        Err(windows_service::Error::Winapi(e))
            if e.raw_os_error() == Some(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT) =>
        {
            warn!(service = %name, "not started by the service control manager; running in the foreground");
            match take_config() {
                Some(config) => run_blocking(config, SignalRegistry::new()),
                None => 1,
            }
        }
        Err(e) => {
            error!(service = %name, error = %e, "service dispatcher failed");
            1
        }
    }
}

/// Maps a control request onto the supervisor's shutdown switch.
pub fn handle_control(registry: &SignalRegistry, control: ServiceControl) -> ServiceControlHandlerResult {
    match control {
        ServiceControl::Stop => {
            registry.trigger("service stop");
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Shutdown => {
            registry.trigger("system shutdown");
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
        _ => ServiceControlHandlerResult::NotImplemented,
    }
}

fn take_config() -> Option<SupervisorConfig> {
    let slot = CONFIG.get()?;
    match slot.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn run_blocking(config: SupervisorConfig, registry: SignalRegistry) -> i32 {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(run_service(config, RunMode::Managed, registry)),
        Err(e) => {
            error!(error = %e, "cannot build the service runtime");
            1
        }
    }
}

fn status(state: ServiceState, exit_code: ServiceExitCode) -> ServiceStatus {
    let controls_accepted = if state == ServiceState::Running {
        ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
    } else {
        ServiceControlAccept::empty()
    };
    ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted,
        exit_code,
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}

fn service_main(_arguments: Vec<OsString>) {
    let Some(config) = take_config() else {
        error!("service started without a configuration");
        return;
    };
    let name = config.service.name.clone();

    let registry = SignalRegistry::new();
    let handler_registry = registry.clone();
    let status_handle = match service_control_handler::register(&name, move |control| {
        handle_control(&handler_registry, control)
    }) {
        Ok(handle) => handle,
        Err(e) => {
            error!(service = %name, error = %e, "cannot register service control handler");
            return;
        }
    };

    if let Err(e) = status_handle.set_service_status(status(ServiceState::Running, ServiceExitCode::Win32(0))) {
        warn!(service = %name, error = %e, "cannot report running state");
    }
    info!(service = %name, "service control handler registered");

    let code = run_blocking(config, registry);
    EXIT_CODE.store(code, Ordering::SeqCst);

    let exit_code = match code {
        0 => ServiceExitCode::Win32(0),
        code => ServiceExitCode::ServiceSpecific(code as u32),
    };
    if let Err(e) = status_handle.set_service_status(status(ServiceState::Stopped, exit_code)) {
        warn!(service = %name, error = %e, "cannot report stopped state");
    }
}

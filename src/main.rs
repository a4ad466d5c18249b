use clap::Parser;
use readiness_supervisor::control::{ConsoleSignalDispatcher, SignalDispatcher, SignalRegistry};
use readiness_supervisor::host::{run_service, RunMode};
use readiness_supervisor::logger::logs_tracing;
use readiness_supervisor::parse::{parser, SupervisorConfig};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "readiness-supervisor", version, about = "Starts a server process and waits until it reports ready")]
struct Cli {
    /// Path to the supervisor configuration
    #[arg(short, long, default_value = "config/config.yml")]
    config: String,

    /// Run as a service-managed process (no console echo)
    #[arg(long)]
    managed: bool,

    /// Send a cooperative shutdown signal to <PID> and exit
    #[arg(long, value_name = "PID")]
    clean_shutdown: Option<u32>,

    /// Executable name the --clean-shutdown target must be running
    #[arg(long, value_name = "NAME", requires = "clean_shutdown")]
    expect: Option<String>,

    /// Extra startup arguments appended to the configured service args
    #[arg(last = true)]
    args: Vec<String>,
}

/// Codes that fit an `ExitCode`; anything wider has to go through
/// `std::process::exit` to survive.
fn exit_status(code: i32) -> Result<ExitCode, i32> {
    u8::try_from(code).map(ExitCode::from).map_err(|_| code)
}

fn load(path: &str) -> Option<SupervisorConfig> {
    match parser(path) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("error: {}", e);
            None
        }
    }
}

#[cfg(windows)]
fn supervise(cfg: SupervisorConfig, mode: RunMode) -> i32 {
    match mode {
        RunMode::Managed => readiness_supervisor::service::run_managed(cfg),
        RunMode::Interactive => run_in_runtime(cfg, mode),
    }
}

#[cfg(not(windows))]
fn supervise(cfg: SupervisorConfig, mode: RunMode) -> i32 {
    run_in_runtime(cfg, mode)
}

fn run_in_runtime(cfg: SupervisorConfig, mode: RunMode) -> i32 {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(run_service(cfg, mode, SignalRegistry::new())),
        Err(e) => {
            eprintln!("error: cannot start runtime: {}", e);
            1
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(pid) = cli.clean_shutdown {
        let expected = match cli.expect {
            Some(name) => name,
            None => match load(&cli.config) {
                Some(cfg) => cfg.service.expected_process_name(),
                None => return ExitCode::from(1),
            },
        };
        return if ConsoleSignalDispatcher.dispatch(pid, &expected) {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        };
    }

    let Some(cfg) = load(&cli.config) else {
        return ExitCode::from(1);
    };
    let cfg = cfg.with_extra_args(cli.args);

    let mode = RunMode::detect(cli.managed);
    let guard = match logs_tracing(&cfg.logs.dir, &format!("{}.log", cfg.service.name), mode) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match exit_status(supervise(cfg, mode)) {
        Ok(code) => code,
        Err(code) => {
            // flush the log before leaving without unwinding
            drop(guard);
            std::process::exit(code)
        }
    }
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};


/*
    @@@
    @SignalRegistry;
    . Per-supervisor shutdown switch; every clone shares one state.
    . trigger() is idempotent and keeps the first reason; subscribers see the flag flip to true exactly once.
    . listen_os_signals() forwards the interactive break signals of this process into the registry.
*/
#[derive(Clone)]
pub struct SignalRegistry {
    tx: Arc<watch::Sender<bool>>,
    reason: Arc<Mutex<Option<String>>>,
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx), reason: Arc::new(Mutex::new(None)) }
    }

    pub fn trigger(&self, reason: &str) {
        {
            let mut slot = match self.reason.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_none() {
                *slot = Some(reason.to_string());
                debug!(reason, "shutdown requested");
            }
        }
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn reason(&self) -> Option<String> {
        match self.reason.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[cfg(unix)]
    pub fn listen_os_signals(&self) -> std::io::Result<JoinHandle<()>> {
        use futures::StreamExt;
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook_tokio::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let registry = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(sig) = signals.next().await {
                info!(signal = sig, "shutdown signal received");
                registry.trigger(&format!("signal {}", sig));
            }
        }))
    }

    #[cfg(not(unix))]
    pub fn listen_os_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let registry = self.clone();
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                registry.trigger("ctrl-c");
            }
        }))
    }
}


/// Sends a cooperative interrupt to one external process.
///
/// Expected failures (no such process, access denied, identity mismatch)
/// come back as `false`.
pub trait SignalDispatcher: Send + Sync {
    fn dispatch(&self, pid: u32, expected_name: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Matches,
    Mismatch(String),
    Missing,
}

fn normalize(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Compares the executable of `pid` with `expected_name`, by process name
/// or by the file stem of its executable path.
pub fn process_identity(pid: u32, expected_name: &str) -> Identity {
    let mut sys = System::new();
    let spid = Pid::from_u32(pid);
    if !sys.refresh_process(spid) {
        return Identity::Missing;
    }
    let Some(process) = sys.process(spid) else {
        return Identity::Missing;
    };
    let expected = normalize(expected_name);
    let name = normalize(process.name());
    let exe_stem = process
        .exe()
        .and_then(|p| p.file_stem())
        .map(|s| normalize(&s.to_string_lossy()));

    if name == expected || exe_stem.as_deref() == Some(expected.as_str()) {
        Identity::Matches
    } else {
        Identity::Mismatch(process.name().to_string())
    }
}

// One dispatch at a time: attaching to a console is process-wide state.
static DISPATCH_LOCK: Mutex<()> = Mutex::new(());


/*
    @@@
    @ConsoleSignalDispatcher;
    . Verifies that the target still runs the expected executable before anything is sent.
    . unix: delivers SIGINT to the pid.
    . windows: attaches to the target's console and raises CTRL_BREAK_EVENT for the target's process group; a drop guard re-attaches to the parent console whatever happens.
*/
#[derive(Debug, Default, Clone)]
pub struct ConsoleSignalDispatcher;

impl SignalDispatcher for ConsoleSignalDispatcher {
    fn dispatch(&self, pid: u32, expected_name: &str) -> bool {
        if pid == 0 {
            warn!(pid, "refusing to signal pid 0");
            return false;
        }
        let _lock = match DISPATCH_LOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match process_identity(pid, expected_name) {
            Identity::Matches => {}
            Identity::Missing => {
                warn!(pid, "no such process; interrupt not sent");
                return false;
            }
            Identity::Mismatch(actual) => {
                warn!(pid, expected = expected_name, actual = %actual, "process identity mismatch; interrupt not sent");
                return false;
            }
        }

        let sent = send_interrupt(pid);
        info!(pid, sent, "cooperative interrupt dispatched");
        sent
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(NixPid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, error = %e, "failed to send SIGINT");
            false
        }
    }
}

#[cfg(windows)]
fn send_interrupt(pid: u32) -> bool {
    console::send_ctrl_break(pid)
}

#[cfg(not(any(unix, windows)))]
fn send_interrupt(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
mod console {
    use tracing::{debug, warn};
    use windows::Win32::System::Console::{
        AttachConsole, FreeConsole, GenerateConsoleCtrlEvent, ATTACH_PARENT_PROCESS, CTRL_BREAK_EVENT,
    };

    /// Attached to the target's console until dropped. Dropping detaches
    /// and re-attaches to the parent's console, also when attach failed.
    struct ForeignConsole;

    impl ForeignConsole {
        fn attach(pid: u32) -> Result<Self, String> {
            let guard = ForeignConsole;
            unsafe {
                let _ = FreeConsole();
                AttachConsole(pid).map_err(|e| format!("AttachConsole({}) failed: {}", pid, e))?;
            }
            Ok(guard)
        }
    }

    impl Drop for ForeignConsole {
        fn drop(&mut self) {
            unsafe {
                let _ = FreeConsole();
                if let Err(e) = AttachConsole(ATTACH_PARENT_PROCESS) {
                    debug!(error = %e, "no parent console to re-attach to");
                }
            }
        }
    }

    // The child runs in its own process group (its pid), so the event never
    // reaches this process or anything else sharing the console.
    pub(super) fn send_ctrl_break(pid: u32) -> bool {
        let console = match ForeignConsole::attach(pid) {
            Ok(console) => console,
            Err(e) => {
                warn!(pid, error = %e, "cannot attach to target console");
                return false;
            }
        };
        let sent = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
        drop(console);
        match sent {
            Ok(()) => true,
            Err(e) => {
                warn!(pid, error = %e, "GenerateConsoleCtrlEvent failed");
                false
            }
        }
    }
}


/// Runs `<exe> --clean-shutdown <pid> --expect <name>` so the console
/// juggling happens in a throwaway process.
#[derive(Debug, Clone)]
pub struct HelperProcessDispatcher {
    exe: PathBuf,
}

impl HelperProcessDispatcher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    /// Uses this binary as the helper.
    pub fn current() -> std::io::Result<Self> {
        std::env::current_exe().map(Self::new)
    }
}

impl SignalDispatcher for HelperProcessDispatcher {
    fn dispatch(&self, pid: u32, expected_name: &str) -> bool {
        let status = std::process::Command::new(&self.exe)
            .arg("--clean-shutdown")
            .arg(pid.to_string())
            .arg("--expect")
            .arg(expected_name)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .status();
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(pid, exe = %self.exe.display(), error = %e, "clean shutdown helper failed to run");
                false
            }
        }
    }
}

/// For platforms without a cooperative interrupt, or graceful stop disabled.
#[derive(Debug, Default, Clone)]
pub struct NoopDispatcher;

impl SignalDispatcher for NoopDispatcher {
    fn dispatch(&self, _pid: u32, _expected_name: &str) -> bool {
        false
    }
}

/// The dispatcher the host uses on this platform.
pub fn platform_dispatcher() -> Arc<dyn SignalDispatcher> {
    if cfg!(windows) {
        match HelperProcessDispatcher::current() {
            Ok(helper) => Arc::new(helper),
            Err(e) => {
                warn!(error = %e, "cannot locate own executable for clean shutdown");
                Arc::new(NoopDispatcher)
            }
        }
    } else if cfg!(unix) {
        Arc::new(ConsoleSignalDispatcher)
    } else {
        Arc::new(NoopDispatcher)
    }
}

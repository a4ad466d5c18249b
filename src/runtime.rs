use crate::classify::ExceptionClassifier;
use crate::control::{SignalDispatcher, SignalRegistry};
use crate::error::SupervisorError;
use crate::monitor::{MonitorReport, OutputMonitor, StartupOutcome};
use crate::parse::SupervisorConfig;
use crate::readiness::{ReadinessDetector, ReadinessPattern, ReadinessState};
use crate::router::OutputRouter;
use crate::source::{ChildProcess, LineSender, ProcessLauncher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{error, info, warn};

// Time the readers get to flush buffered output after the child exited.
const READER_DRAIN: Duration = Duration::from_secs(2);
// Upper bound on waiting for a killed child to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);
const TASK_WAIT: Duration = Duration::from_secs(5);


/// The collaborators a supervisor is built from.
pub struct SupervisorParts {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub detector: ReadinessDetector,
    pub classifier: ExceptionClassifier,
    pub router: OutputRouter,
    pub dispatcher: Arc<dyn SignalDispatcher>,
    pub registry: SignalRegistry,
}

impl SupervisorParts {
    /// Detector and classifier as described by `cfg`, with a fresh registry.
    pub fn from_config(
        cfg: &SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        dispatcher: Arc<dyn SignalDispatcher>,
        router: OutputRouter,
    ) -> Self {
        let pattern = ReadinessPattern::new(cfg.readiness.component.clone(), cfg.readiness.marker.clone());
        Self {
            launcher,
            detector: ReadinessDetector::new(pattern, cfg.readiness.timeout(), cfg.readiness.max_lines),
            classifier: ExceptionClassifier::from_config(&cfg.faults),
            router,
            dispatcher,
            registry: SignalRegistry::new(),
        }
    }
}

struct Pending {
    detector: ReadinessDetector,
    classifier: ExceptionClassifier,
    router: OutputRouter,
}

struct RunningChild {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<i32>>,
    monitor: JoinHandle<MonitorReport>,
    watcher: JoinHandle<()>,
}


/*
    @@@
    @ProcessSupervisor;
    . Owns the one child process: start() launches it and blocks until the output monitor reports a terminal readiness state.
    . stop() is idempotent: interrupts a pending start(), asks the child to leave (cooperative interrupt, then kill), records the exit code.
    . The exit watcher task is the only place the child handle is waited on or killed.
*/
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    dispatcher: Arc<dyn SignalDispatcher>,
    registry: SignalRegistry,
    pending: std::sync::Mutex<Option<Pending>>,
    running: Mutex<Option<RunningChild>>,
    exit: Arc<watch::Sender<Option<i32>>>,
    ready: Arc<AtomicBool>,
    pid: AtomicU32,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, parts: SupervisorParts) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            config,
            launcher: parts.launcher,
            dispatcher: parts.dispatcher,
            registry: parts.registry,
            pending: std::sync::Mutex::new(Some(Pending {
                detector: parts.detector,
                classifier: parts.classifier,
                router: parts.router,
            })),
            running: Mutex::new(None),
            exit: Arc::new(exit),
            ready: Arc::new(AtomicBool::new(false)),
            pid: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some() && self.last_exit_code().is_none()
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        let name = self.config.service.name.clone();
        let pending = match self.pending.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(Pending { detector, classifier, router }) = pending else {
            return Err(SupervisorError::AlreadyStarted(name));
        };

        let outcome_rx = {
            let mut running = self.running.lock().await;
            if self.registry.is_triggered() {
                return Err(SupervisorError::ReadinessTimeout {
                    service: name,
                    detail: "stop was requested before the process was launched".into(),
                    lines: 0,
                });
            }

            let launched = self.launcher.launch(&self.config.service).await?;
            let pid = launched.child.id();
            self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);

            let (kill_tx, kill_rx) = oneshot::channel();
            let watcher = tokio::spawn(watch_exit(
                name.clone(),
                launched.child,
                kill_rx,
                self.exit.clone(),
                launched.sender,
                launched.readers,
                self.registry.clone(),
                self.ready.clone(),
            ));

            let (outcome_tx, outcome_rx) = oneshot::channel();
            let deadline = Instant::now() + self.config.readiness.timeout();
            let monitor = OutputMonitor::new(name.clone(), detector, classifier, router);
            let monitor = tokio::spawn(monitor.run(
                launched.lines,
                deadline,
                self.registry.subscribe(),
                outcome_tx,
            ));

            *running = Some(RunningChild {
                pid,
                kill_tx: Some(kill_tx),
                exit_rx: self.exit.subscribe(),
                monitor,
                watcher,
            });
            outcome_rx
        };

        let outcome = outcome_rx.await.unwrap_or_else(|_| StartupOutcome {
            state: ReadinessState::TimedOut { detail: "output monitor stopped unexpectedly".into() },
            lines: 0,
        });

        match outcome.state {
            ReadinessState::Ready => {
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            ReadinessState::Faulted { kind, detail } => {
                Err(SupervisorError::ReadinessFault { kind, message: detail })
            }
            ReadinessState::TimedOut { detail } => Err(SupervisorError::ReadinessTimeout {
                service: name,
                detail,
                lines: outcome.lines,
            }),
            ReadinessState::Watching => Err(SupervisorError::ReadinessTimeout {
                service: name,
                detail: "readiness wait ended without a result".into(),
                lines: outcome.lines,
            }),
        }
    }

    /// Resolves with the exit code once the child has exited. Only
    /// meaningful after `start()` launched something.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return Some(code);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }



    /*
        @@@
        @stop();
        . Triggers the registry first, which unblocks a start() still waiting for readiness.
        . Sends the cooperative interrupt when enabled and waits up to stoptime; falls back to a kill.
        . Waits for the watcher and the output monitor so no reader outlives the child, then returns the last exit code.
    */
    pub async fn stop(&self) -> Option<i32> {
        let name = &self.config.service.name;
        self.registry.trigger("stop requested");

        let mut running = self.running.lock().await;
        let Some(mut child) = running.take() else {
            return self.last_exit_code();
        };

        if child.exit_rx.borrow().is_none() {
            let mut exited = false;
            if let (true, Some(pid)) = (self.config.stop.graceful, child.pid) {
                let dispatcher = self.dispatcher.clone();
                let expected = self.config.service.expected_process_name();
                let signalled = tokio::task::spawn_blocking(move || dispatcher.dispatch(pid, &expected))
                    .await
                    .unwrap_or(false);
                if signalled {
                    info!(service = %name, pid, stoptime = self.config.stop.stoptime, "Waiting for graceful exit");
                    exited = wait_for_exit(&mut child.exit_rx, self.config.stop.stoptime()).await;
                }
            }

            if !exited {
                warn!(service = %name, pid = ?child.pid, "Forcing process termination");
                if let Some(kill_tx) = child.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
                if !wait_for_exit(&mut child.exit_rx, KILL_WAIT).await {
                    error!(service = %name, pid = ?child.pid, "Process did not exit after kill");
                }
            }
        }

        if timeout(TASK_WAIT, &mut child.watcher).await.is_err() {
            child.watcher.abort();
        }
        if timeout(TASK_WAIT, &mut child.monitor).await.is_err() {
            child.monitor.abort();
        }

        let code = self.last_exit_code();
        info!(service = %name, exit_code = ?code, "Supervisor stopped");
        code
    }
}

async fn wait_for_exit(rx: &mut watch::Receiver<Option<i32>>, limit: Duration) -> bool {
    let waited = timeout(limit, async {
        loop {
            if rx.borrow_and_update().is_some() {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;
    matches!(waited, Ok(true))
}



/*
    @@@
    @watch_exit();
    . Waits for the child, or kills it when stop() asks through kill_rx; publishes the exit code.
    . An exit after readiness that nobody asked for is logged as unexpected.
    . Gives the readers READER_DRAIN to flush, aborts the stragglers, then emits the end marker.
*/
#[allow(clippy::too_many_arguments)]
async fn watch_exit(
    service: String,
    mut child: Box<dyn ChildProcess>,
    mut kill_rx: oneshot::Receiver<()>,
    exit: Arc<watch::Sender<Option<i32>>>,
    sender: LineSender,
    readers: Vec<JoinHandle<()>>,
    registry: SignalRegistry,
    ready: Arc<AtomicBool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.kill().await {
                error!(service = %service, error = %e, "failed to kill child");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(code) => code,
        Err(e) => {
            error!(service = %service, error = %e, "waiting for child failed");
            1
        }
    };
    exit.send_replace(Some(code));

    if ready.load(Ordering::SeqCst) && !registry.is_triggered() {
        warn!(service = %service, exit_code = code, "Process exited unexpectedly");
    } else {
        info!(service = %service, exit_code = code, "Process exited");
    }

    let aborts: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
    if timeout(READER_DRAIN, futures::future::join_all(readers)).await.is_err() {
        warn!(service = %service, "Output readers still open after exit; closing them");
        for handle in aborts {
            handle.abort();
        }
    }
    sender.end();
}

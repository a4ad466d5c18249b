#![allow(dead_code)]

use async_trait::async_trait;
use readiness_supervisor::control::SignalDispatcher;
use readiness_supervisor::parse::{from_yaml, ServiceConfig, SupervisorConfig};
use readiness_supervisor::router::{MemorySink, OutputRouter};
use readiness_supervisor::runtime::{ProcessSupervisor, SupervisorParts};
use readiness_supervisor::source::{line_channel, ChildProcess, LaunchedProcess, ProcessLauncher};
use readiness_supervisor::output::StreamKind;
use readiness_supervisor::{RunMode, SupervisorError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const READY: &str = "[2024-05-01T10:00:03,120][INFO ][o.e.n.Node               ] [node-1] started";
pub const READY_OTHER: &str = "[2024-05-01T10:00:03,120][INFO ][o.e.n.NodeXX             ] [node-1] started";
pub const FUNKY: &str = "Exception in thread \"main\" java.lang.IllegalStateException: funky";
pub const BAD_CONFIG: &str =
    "Exception in thread \"main\" org.search.bootstrap.StartupException: unknown setting [node.colour]";

pub const KILLED: i32 = 137;
pub const FAKE_PID: u32 = 4242;

#[derive(Debug, Clone)]
pub enum Step {
    Out(&'static str),
    Err(&'static str),
    End,
}

pub fn config(timeout_secs: u64) -> SupervisorConfig {
    from_yaml(&format!(
        r#"
service:
  name: search
  cmd: /opt/search/bin/search-node
  process_name: java
readiness:
  component: o.e.n.Node
  timeout: {}
stop:
  stoptime: 1
"#,
        timeout_secs
    ))
    .unwrap()
}

/// A child that exits when told to, after a fixed delay, or when killed.
pub struct ScriptedChild {
    exit_rx: Option<oneshot::Receiver<i32>>,
    exit_after: Option<(Duration, i32)>,
    killed: bool,
}

#[async_trait]
impl ChildProcess for ScriptedChild {
    fn id(&self) -> Option<u32> {
        Some(FAKE_PID)
    }

    async fn wait(&mut self) -> std::io::Result<i32> {
        if self.killed {
            return Ok(KILLED);
        }
        if let Some((delay, code)) = self.exit_after {
            tokio::time::sleep(delay).await;
            return Ok(code);
        }
        if let Some(rx) = self.exit_rx.as_mut() {
            if let Ok(code) = rx.await {
                return Ok(code);
            }
        }
        std::future::pending().await
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.killed = true;
        Ok(())
    }
}

pub struct ScriptedLauncher {
    steps: Vec<Step>,
    exit_rx: Mutex<Option<oneshot::Receiver<i32>>>,
    exit_after: Option<(Duration, i32)>,
    fail: bool,
}

impl ScriptedLauncher {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps, exit_rx: Mutex::new(None), exit_after: None, fail: false }
    }

    /// The returned sender makes the child exit with the given code.
    pub fn with_exit_trigger(steps: Vec<Step>) -> (Self, oneshot::Sender<i32>) {
        let (tx, rx) = oneshot::channel();
        let launcher = Self { steps, exit_rx: Mutex::new(Some(rx)), exit_after: None, fail: false };
        (launcher, tx)
    }

    pub fn exiting_after(steps: Vec<Step>, delay: Duration, code: i32) -> Self {
        Self { steps, exit_rx: Mutex::new(None), exit_after: Some((delay, code)), fail: false }
    }

    pub fn failing() -> Self {
        Self { steps: vec![], exit_rx: Mutex::new(None), exit_after: None, fail: true }
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, service: &ServiceConfig) -> Result<LaunchedProcess, SupervisorError> {
        if self.fail {
            return Err(SupervisorError::ProcessLaunch {
                cmd: service.cmd.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        let (sender, lines) = line_channel();
        for step in &self.steps {
            match step {
                Step::Out(text) => {
                    sender.line(StreamKind::Stdout, *text);
                }
                Step::Err(text) => {
                    sender.line(StreamKind::Stderr, *text);
                }
                Step::End => {
                    sender.end();
                }
            }
        }
        let exit_rx = self.exit_rx.lock().unwrap().take();
        let child = ScriptedChild { exit_rx, exit_after: self.exit_after, killed: false };
        Ok(LaunchedProcess { child: Box::new(child), lines, sender, readers: vec![] })
    }
}

/// Records every dispatch; optionally makes the child exit with 0.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub calls: Mutex<Vec<(u32, String)>>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

impl RecordingDispatcher {
    pub fn refusing() -> Self {
        Self::default()
    }

    pub fn exiting(exit_tx: oneshot::Sender<i32>) -> Self {
        Self { calls: Mutex::new(Vec::new()), exit_tx: Mutex::new(Some(exit_tx)) }
    }
}

impl SignalDispatcher for RecordingDispatcher {
    fn dispatch(&self, pid: u32, expected_name: &str) -> bool {
        self.calls.lock().unwrap().push((pid, expected_name.to_string()));
        match self.exit_tx.lock().unwrap().take() {
            Some(tx) => tx.send(0).is_ok(),
            None => false,
        }
    }
}

pub struct Rig {
    pub supervisor: Arc<ProcessSupervisor>,
    pub handler: MemorySink,
    pub writer: MemorySink,
    pub dispatcher: Arc<RecordingDispatcher>,
}

pub fn rig(
    cfg: SupervisorConfig,
    launcher: ScriptedLauncher,
    dispatcher: RecordingDispatcher,
    mode: RunMode,
) -> Rig {
    let handler = MemorySink::new();
    let writer = MemorySink::new();
    let dispatcher = Arc::new(dispatcher);
    let router = OutputRouter::new(Box::new(handler.clone()), Box::new(writer.clone()), mode);
    let parts = SupervisorParts::from_config(&cfg, Arc::new(launcher), dispatcher.clone(), router);
    let supervisor = Arc::new(ProcessSupervisor::new(cfg, parts));
    Rig { supervisor, handler, writer, dispatcher }
}

use crate::error::SupervisorError;
use crate::output::{LineEvent, OutputLine, StreamKind};
use crate::parse::ServiceConfig;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};


pub type LineReceiver = mpsc::UnboundedReceiver<LineEvent>;

struct SenderState {
    next_seq: u64,
    tx: Option<mpsc::UnboundedSender<LineEvent>>,
}

/// Sequencing front for the line channel.
///
/// Every reader shares one `LineSender`. The sequence number is taken and
/// the event enqueued under the same lock, so the receiver sees events in
/// strictly increasing `seq` order. After `end()` the channel is closed and
/// anything offered later is dropped.
#[derive(Clone)]
pub struct LineSender {
    inner: Arc<Mutex<SenderState>>,
}

pub fn line_channel() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = LineSender {
        inner: Arc::new(Mutex::new(SenderState { next_seq: 0, tx: Some(tx) })),
    };
    (sender, rx)
}

impl LineSender {
    pub fn line(&self, stream: StreamKind, text: impl Into<String>) -> bool {
        let text = text.into();
        self.push(|seq| LineEvent::Line(OutputLine::new(seq, stream, text)))
    }

    pub fn read_fault(&self, stream: StreamKind, error: impl Into<String>) -> bool {
        let error = error.into();
        self.push(|seq| LineEvent::ReadFault { seq, stream, error })
    }

    /// Emits the end marker. Returns true only for the call that sent it.
    pub fn end(&self) -> bool {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.tx.take() {
            Some(tx) => {
                let _ = tx.send(LineEvent::Ended);
                true
            }
            None => false,
        }
    }

    pub fn is_ended(&self) -> bool {
        match self.inner.lock() {
            Ok(state) => state.tx.is_none(),
            Err(poisoned) => poisoned.into_inner().tx.is_none(),
        }
    }

    fn push(&self, make: impl FnOnce(u64) -> LineEvent) -> bool {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let seq = state.next_seq;
        let Some(tx) = state.tx.as_ref() else {
            return false;
        };
        if tx.send(make(seq)).is_err() {
            return false;
        }
        state.next_seq += 1;
        true
    }
}



/*
    @@@
    @spawn_reader();
    . Reads one child pipe line by line on its own task; bytes are decoded lossily and the trailing \r\n stripped.
    . Forwards each line into the shared LineSender so both pipes land in one sequence.
    . A read error is forwarded once as a ReadFault carrying the error text, then the reader stops.
*/
pub fn spawn_reader<R>(reader: R, stream: StreamKind, sender: LineSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                        buf.pop();
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if !sender.line(stream, text) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%stream, error = %e, "reading child output failed");
                    sender.read_fault(stream, e.to_string());
                    break;
                }
            }
        }
        debug!(%stream, "output reader finished");
    })
}


/// The child process as seen by the supervisor.
#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Waits for exit and returns the exit code.
    async fn wait(&mut self) -> std::io::Result<i32>;

    /// Forceful termination.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Maps an exit status to a code; a signal death becomes 128 + signal.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

#[async_trait]
impl ChildProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn wait(&mut self) -> std::io::Result<i32> {
        Child::wait(self).await.map(exit_code_of)
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self).await
    }
}


/// A launched child plus the ordered view of its output.
pub struct LaunchedProcess {
    pub child: Box<dyn ChildProcess>,
    pub lines: LineReceiver,
    pub sender: LineSender,
    pub readers: Vec<JoinHandle<()>>,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, service: &ServiceConfig) -> Result<LaunchedProcess, SupervisorError>;
}

/// Launches the service through `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, service: &ServiceConfig) -> Result<LaunchedProcess, SupervisorError> {
        let mut cmd = Command::new(&service.cmd);
        cmd.args(&service.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &service.workingdir {
            cmd.current_dir(dir);
        }
        if let Some(envs) = &service.env {
            cmd.envs(envs);
        }

        // The child leads its own process group (group id = pid), which is
        // what the Ctrl-Break dispatch targets. Ctrl-C is disabled in it.
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::ProcessLaunch {
            cmd: service.cmd.clone(),
            source: e,
        })?;
        info!(service = %service.name, pid = ?child.id(), cmd = %service.cmd, "Spawned child process");

        let (sender, lines) = line_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, StreamKind::Stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, StreamKind::Stderr, sender.clone()));
        }

        Ok(LaunchedProcess { child: Box::new(child), lines, sender, readers })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_is_shared_across_streams() {
        let (sender, mut rx) = line_channel();
        sender.line(StreamKind::Stdout, "a");
        sender.line(StreamKind::Stderr, "b");
        sender.read_fault(StreamKind::Stdout, "broken pipe");
        sender.line(StreamKind::Stdout, "c");

        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(rx.recv().await.and_then(|e| e.seq()).unwrap());
        }
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_end_is_sent_once_and_closes_channel() {
        let (sender, mut rx) = line_channel();
        sender.line(StreamKind::Stdout, "before");
        assert!(sender.end());
        assert!(!sender.end());
        assert!(!sender.line(StreamKind::Stdout, "after"));
        assert!(sender.is_ended());

        assert_eq!(rx.recv().await.unwrap().as_line().unwrap().text, "before");
        assert_eq!(rx.recv().await, Some(LineEvent::Ended));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reader_strips_line_endings_and_keeps_partial_tail() {
        let (sender, mut rx) = line_channel();
        let data: &[u8] = b"first\r\nsecond\nthird";
        spawn_reader(data, StreamKind::Stdout, sender.clone()).await.unwrap();
        sender.end();

        let mut texts = Vec::new();
        while let Some(LineEvent::Line(line)) = rx.recv().await {
            texts.push(line.text);
        }
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_reader_decodes_invalid_utf8_lossily() {
        let (sender, mut rx) = line_channel();
        let data: &[u8] = b"caf\xff\n";
        spawn_reader(data, StreamKind::Stderr, sender).await.unwrap();

        let line = rx.recv().await.unwrap();
        let line = line.as_line().unwrap();
        assert_eq!(line.stream, StreamKind::Stderr);
        assert!(line.text.starts_with("caf"));
    }

    #[tokio::test]
    async fn test_launch_failure_is_typed() {
        let service = ServiceConfig {
            name: "ghost".into(),
            cmd: "/definitely/not/a/real/binary".into(),
            args: vec![],
            workingdir: None,
            env: None,
            process_name: None,
        };
        let err = CommandLauncher.launch(&service).await.err().unwrap();
        assert!(matches!(err, SupervisorError::ProcessLaunch { .. }));
    }
}

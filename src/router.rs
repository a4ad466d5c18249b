use crate::host::RunMode;
use crate::output::{LineEvent, OutputLine, StreamKind};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A consumer of child output.
///
/// `finish` is called once, when the end-of-output marker is observed.
pub trait OutputSink: Send {
    fn write_line(&mut self, line: &OutputLine);

    fn finish(&mut self) {}
}

/// Mirrors child output to this process' stdout/stderr, nothing else.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    label: String,
}

impl ConsoleSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl OutputSink for ConsoleSink {
    fn write_line(&mut self, line: &OutputLine) {
        // A closed console must not take the supervisor down.
        let _ = match line.stream {
            StreamKind::Stdout => writeln!(std::io::stdout().lock(), "{}", line.text),
            StreamKind::Stderr => writeln!(std::io::stderr().lock(), "{}", line.text),
        };
    }

    fn finish(&mut self) {
        debug!(service = %self.label, "process output closed");
    }
}

/// Records startup output in the operational log.
#[derive(Debug, Default)]
pub struct LogHandler {
    service: String,
}

impl LogHandler {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

impl OutputSink for LogHandler {
    fn write_line(&mut self, line: &OutputLine) {
        info!(target: "startup", service = %self.service, seq = line.seq, stream = %line.stream, "{}", line.text);
    }
}

/// Keeps everything it receives; the end marker is kept as `LineEvent::Ended`.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.as_line().map(|l| l.text.clone()))
            .collect()
    }

    fn push(&self, event: LineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl OutputSink for MemorySink {
    fn write_line(&mut self, line: &OutputLine) {
        self.push(LineEvent::Line(line.clone()));
    }

    fn finish(&mut self) {
        self.push(LineEvent::Ended);
    }
}


/*
    @@@
    @OutputRouter;
    . Fans each line out to the Handler (readiness window only) and the Writer (whole process lifetime).
    . The Handler is dropped by close_handler(); nothing reaches it afterwards.
    . The Writer only exists in Interactive mode and is dropped at the end marker, so nothing after it is ever written.
*/
pub struct OutputRouter {
    handler: Option<Box<dyn OutputSink>>,
    writer: Option<Box<dyn OutputSink>>,
    handled: usize,
    written: usize,
}

impl OutputRouter {
    pub fn new(handler: Box<dyn OutputSink>, writer: Box<dyn OutputSink>, mode: RunMode) -> Self {
        let writer = match mode {
            RunMode::Interactive => Some(writer),
            RunMode::Managed => None,
        };
        Self { handler: Some(handler), writer, handled: 0, written: 0 }
    }

    pub fn handle(&mut self, line: &OutputLine) {
        if let Some(handler) = self.handler.as_mut() {
            handler.write_line(line);
            self.handled += 1;
        }
    }

    pub fn write(&mut self, line: &OutputLine) {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_line(line);
            self.written += 1;
        }
    }

    pub fn close_handler(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            handler.finish();
        }
    }

    pub fn end(&mut self) {
        self.close_handler();
        if let Some(mut writer) = self.writer.take() {
            writer.finish();
        }
    }

    pub fn handled(&self) -> usize {
        self.handled
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn is_writing(&self) -> bool {
        self.writer.is_some()
    }
}

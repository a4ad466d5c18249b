use crate::classify::ExceptionClassifier;
use crate::output::LineEvent;
use crate::readiness::{ReadinessDetector, ReadinessState};
use crate::router::OutputRouter;
use crate::source::LineReceiver;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Result of the readiness wait: terminal state plus lines the Handler saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupOutcome {
    pub state: ReadinessState,
    pub lines: usize,
}

/// Final accounting of one output pump run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub outcome: ReadinessState,
    pub handled: usize,
    pub written: usize,
}

/// Owns everything that looks at child output. One event at a time goes
/// through classifier, router and detector, in `seq` order.
pub struct OutputMonitor {
    service: String,
    detector: ReadinessDetector,
    classifier: ExceptionClassifier,
    router: OutputRouter,
}

impl OutputMonitor {
    pub fn new(
        service: impl Into<String>,
        detector: ReadinessDetector,
        classifier: ExceptionClassifier,
        router: OutputRouter,
    ) -> Self {
        Self { service: service.into(), detector, classifier, router }
    }



    /*
        @@@
        @run();
        . Phase 1 (readiness wait): picks, in order, a stop request, the deadline, then the next event, until the detector is terminal.
        . Sends the terminal state once through `outcome`; the Handler is closed at that point.
        . Phase 2: keeps feeding the Writer until the end marker; late faults are only logged.
    */
    pub async fn run(
        mut self,
        mut lines: LineReceiver,
        deadline: Instant,
        mut stop: watch::Receiver<bool>,
        outcome: oneshot::Sender<StartupOutcome>,
    ) -> MonitorReport {
        let mut ended = false;
        let mut stop_open = true;

        while !self.detector.is_terminal() {
            if *stop.borrow() {
                self.detector.aborted();
                break;
            }
            tokio::select! {
                biased;
                changed = stop.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                    }
                }
                _ = sleep_until(deadline) => self.detector.time_expired(),
                event = lines.recv() => {
                    match event {
                        Some(LineEvent::Ended) | None => {
                            ended = true;
                            self.detector.stream_ended();
                        }
                        Some(event) => self.startup_event(event),
                    }
                }
            }
        }

        let state = self.detector.state().clone();
        let handled = self.router.handled();
        self.router.close_handler();
        match &state {
            ReadinessState::Ready => info!(service = %self.service, lines = handled, "Process is ready"),
            ReadinessState::Faulted { kind, detail } => {
                error!(service = %self.service, lines = handled, %kind, "Startup fault: {}", detail)
            }
            ReadinessState::TimedOut { detail } => {
                warn!(service = %self.service, lines = handled, "Readiness wait ended: {}", detail)
            }
            ReadinessState::Watching => {}
        }
        let _ = outcome.send(StartupOutcome { state: state.clone(), lines: handled });

        if !ended {
            while let Some(event) = lines.recv().await {
                match event {
                    LineEvent::Ended => break,
                    LineEvent::ReadFault { stream, error, .. } => {
                        warn!(service = %self.service, %stream, %error, "Output pipe failed");
                    }
                    LineEvent::Line(line) => {
                        if let Some(fault) = self.classifier.classify_text(&line.text) {
                            error!(service = %self.service, kind = %fault.kind, seq = line.seq, "Fault after startup: {}", fault.message);
                        }
                        self.router.write(&line);
                    }
                }
            }
        }
        self.router.end();
        debug!(service = %self.service, written = self.router.written(), "Output monitor finished");

        MonitorReport { outcome: state, handled, written: self.router.written() }
    }

    fn startup_event(&mut self, event: LineEvent) {
        if let Some(fault) = self.classifier.classify(&event) {
            self.detector.fault(fault.kind, fault.message);
            return;
        }
        if let LineEvent::Line(line) = event {
            self.router.handle(&line);
            self.router.write(&line);
            self.detector.observe(&line);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RunMode;
    use crate::output::{OutputLine, StreamKind};
    use crate::readiness::{FaultKind, ReadinessPattern};
    use crate::router::MemorySink;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const READY: &str = "[2024-05-01T10:00:03,120][INFO ][o.e.n.Node               ] [node-1] started";

    struct Harness {
        tx: mpsc::UnboundedSender<LineEvent>,
        stop: watch::Sender<bool>,
        outcome: oneshot::Receiver<StartupOutcome>,
        task: tokio::task::JoinHandle<MonitorReport>,
        handler: MemorySink,
        writer: MemorySink,
        seq: u64,
    }

    impl Harness {
        fn start(mode: RunMode, timeout: Duration) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let (stop, stop_rx) = watch::channel(false);
            let (outcome_tx, outcome) = oneshot::channel();
            let handler = MemorySink::new();
            let writer = MemorySink::new();
            let monitor = OutputMonitor::new(
                "search",
                ReadinessDetector::new(ReadinessPattern::new("o.e.n.Node", "started"), timeout, None),
                ExceptionClassifier::new(vec!["StartupException".into()], vec!["Exception in thread".into()]),
                OutputRouter::new(Box::new(handler.clone()), Box::new(writer.clone()), mode),
            );
            let task = tokio::spawn(monitor.run(rx, Instant::now() + timeout, stop_rx, outcome_tx));
            Self { tx, stop, outcome, task, handler, writer, seq: 0 }
        }

        fn line(&mut self, text: &str) {
            let _ = self.tx.send(LineEvent::Line(OutputLine::new(self.seq, StreamKind::Stdout, text)));
            self.seq += 1;
        }

        fn end(&self) {
            let _ = self.tx.send(LineEvent::Ended);
        }
    }

    #[tokio::test]
    async fn test_post_ready_lines_reach_writer_only() {
        let mut h = Harness::start(RunMode::Interactive, Duration::from_secs(5));
        h.line("A");
        h.line("B");
        h.line(READY);
        h.line("C");
        assert_eq!((&mut h.outcome).await.unwrap().state, ReadinessState::Ready);

        h.end();
        let report = h.task.await.unwrap();
        assert_eq!(report.handled, 3);
        assert_eq!(h.handler.lines(), vec!["A", "B", READY]);
        assert_eq!(h.writer.lines(), vec!["A", "B", READY, "C"]);
    }

    #[tokio::test]
    async fn test_fault_line_is_withheld_from_handler_and_writer() {
        let mut h = Harness::start(RunMode::Interactive, Duration::from_secs(5));
        h.line("A");
        h.line("B");
        h.line("Exception in thread \"main\" java.lang.RuntimeException: funky");
        match (&mut h.outcome).await.unwrap().state {
            ReadinessState::Faulted { kind, detail } => {
                assert_eq!(kind, FaultKind::Generic);
                assert!(detail.contains("funky"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        h.end();
        let report = h.task.await.unwrap();
        assert_eq!(report.handled, 2);
        assert_eq!(h.writer.lines(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_read_fault_ends_wait_as_generic_fault() {
        let mut h = Harness::start(RunMode::Managed, Duration::from_secs(5));
        h.line("A");
        let _ = h.tx.send(LineEvent::ReadFault { seq: 1, stream: StreamKind::Stderr, error: "pipe gone".into() });
        match (&mut h.outcome).await.unwrap().state {
            ReadinessState::Faulted { kind, detail } => {
                assert_eq!(kind, FaultKind::Generic);
                assert!(detail.contains("pipe gone"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        h.end();
        assert_eq!(h.task.await.unwrap().handled, 1);
    }

    #[tokio::test]
    async fn test_stop_request_aborts_wait() {
        let mut h = Harness::start(RunMode::Interactive, Duration::from_secs(60));
        h.line("A");
        tokio::task::yield_now().await;
        let _ = h.stop.send(true);
        match (&mut h.outcome).await.unwrap().state {
            ReadinessState::TimedOut { detail } => assert!(detail.contains("aborted")),
            other => panic!("unexpected outcome {:?}", other),
        }
        h.end();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_times_out_silent_process() {
        let mut h = Harness::start(RunMode::Interactive, Duration::from_secs(30));
        h.line("A");
        match (&mut h.outcome).await.unwrap().state {
            ReadinessState::TimedOut { detail } => assert!(detail.contains("1 lines consumed")),
            other => panic!("unexpected outcome {:?}", other),
        }
        h.end();
        assert_eq!(h.task.await.unwrap().handled, 1);
    }

    #[tokio::test]
    async fn test_late_fault_does_not_change_outcome() {
        let mut h = Harness::start(RunMode::Interactive, Duration::from_secs(5));
        h.line(READY);
        h.line("Exception in thread \"main\" java.lang.OutOfMemoryError");
        assert_eq!((&mut h.outcome).await.unwrap().state, ReadinessState::Ready);
        h.end();
        let report = h.task.await.unwrap();
        assert_eq!(report.outcome, ReadinessState::Ready);
        assert_eq!(h.writer.lines().len(), 2);
    }
}

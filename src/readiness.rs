use crate::output::OutputLine;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Unclassified runtime fault.
    Generic,
    /// The process reports it cannot start, usually bad configuration.
    StartupFault,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Generic => f.write_str("generic"),
            FaultKind::StartupFault => f.write_str("startup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Watching,
    Ready,
    Faulted { kind: FaultKind, detail: String },
    TimedOut { detail: String },
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Watching)
    }
}

// [timestamp][LEVEL ][component   ] [node] message
fn log_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\[[^\]]*\]\s*\[\s*(?P<level>[A-Za-z]+)\s*\]\s*\[\s*(?P<component>[^\]]*?)\s*\]\s*(?:\[(?P<node>[^\]]*)\]\s*)?(?P<message>.*)$",
        )
        .expect("static readiness regex")
    })
}

/// A structured server log line, split into its bracketed segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogLine<'a> {
    pub level: &'a str,
    pub component: &'a str,
    pub node: Option<&'a str>,
    pub message: &'a str,
}

pub fn parse_log_line(text: &str) -> Option<ParsedLogLine<'_>> {
    let caps = log_line_regex().captures(text)?;
    Some(ParsedLogLine {
        level: caps.name("level")?.as_str(),
        component: caps.name("component")?.as_str(),
        node: caps.name("node").map(|m| m.as_str()),
        message: caps.name("message")?.as_str().trim(),
    })
}

/// Readiness line: marker text from the expected component, nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPattern {
    component: String,
    marker: String,
}

impl ReadinessPattern {
    pub fn new(component: impl Into<String>, marker: impl Into<String>) -> Self {
        Self { component: component.into(), marker: marker.into() }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn matches(&self, text: &str) -> bool {
        match parse_log_line(text) {
            Some(parsed) => parsed.component == self.component && parsed.message == self.marker,
            None => false,
        }
    }
}


/*
    @@@
    @ReadinessDetector;
    . Counts every line it observes and settles exactly once: Ready on the first scoped marker line, TimedOut when the stream ends or a budget runs out.
    . Faults come from the classifier through fault(); the detector never parses fault markers itself.
    . Once terminal, every further call is ignored.
*/
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    pattern: ReadinessPattern,
    max_lines: Option<usize>,
    timeout: Duration,
    consumed: usize,
    state: ReadinessState,
}

impl ReadinessDetector {
    pub fn new(pattern: ReadinessPattern, timeout: Duration, max_lines: Option<usize>) -> Self {
        Self { pattern, max_lines, timeout, consumed: 0, state: ReadinessState::Watching }
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn observe(&mut self, line: &OutputLine) -> &ReadinessState {
        if self.is_terminal() {
            return &self.state;
        }
        self.consumed += 1;
        if self.pattern.matches(&line.text) {
            self.settle(ReadinessState::Ready);
        } else if self.max_lines.is_some_and(|max| self.consumed >= max) {
            let detail = format!(
                "no readiness line from `{}` within the first {} lines",
                self.pattern.component(),
                self.consumed
            );
            self.settle(ReadinessState::TimedOut { detail });
        }
        &self.state
    }

    pub fn stream_ended(&mut self) {
        let detail = format!(
            "output ended after {} lines without a readiness line from `{}`",
            self.consumed,
            self.pattern.component()
        );
        self.settle(ReadinessState::TimedOut { detail });
    }

    pub fn time_expired(&mut self) {
        let detail = format!(
            "no readiness line from `{}` within {:?} ({} lines consumed)",
            self.pattern.component(),
            self.timeout,
            self.consumed
        );
        self.settle(ReadinessState::TimedOut { detail });
    }

    pub fn aborted(&mut self) {
        let detail = format!("startup aborted by stop request after {} lines", self.consumed);
        self.settle(ReadinessState::TimedOut { detail });
    }

    pub fn fault(&mut self, kind: FaultKind, message: impl Into<String>) {
        self.settle(ReadinessState::Faulted { kind, detail: message.into() });
    }

    fn settle(&mut self, next: ReadinessState) {
        if !self.is_terminal() {
            self.state = next;
        }
    }
}

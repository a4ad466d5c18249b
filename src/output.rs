use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of child output. `seq` is global across both streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub seq: u64,
    pub stream: StreamKind,
    pub text: String,
}

impl OutputLine {
    pub fn new(seq: u64, stream: StreamKind, text: impl Into<String>) -> Self {
        Self { seq, stream, text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(OutputLine),
    /// The pipe itself failed; carries the I/O error text, never child output.
    ReadFault {
        seq: u64,
        stream: StreamKind,
        error: String,
    },
    /// Both streams are closed or the process is gone. Sent once.
    Ended,
}

impl LineEvent {
    pub fn seq(&self) -> Option<u64> {
        match self {
            LineEvent::Line(line) => Some(line.seq),
            LineEvent::ReadFault { seq, .. } => Some(*seq),
            LineEvent::Ended => None,
        }
    }

    pub fn as_line(&self) -> Option<&OutputLine> {
        match self {
            LineEvent::Line(line) => Some(line),
            _ => None,
        }
    }
}

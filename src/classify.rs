use crate::output::LineEvent;
use crate::parse::FaultConfig;
use crate::readiness::FaultKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    /// Original fault text, verbatim.
    pub message: String,
}

/// Spots fault markers embedded in the output stream.
///
/// Startup markers are checked first, so a line carrying both kinds is a
/// `StartupFault`. A pipe read failure is always a `Generic` fault.
#[derive(Debug, Clone, Default)]
pub struct ExceptionClassifier {
    startup_markers: Vec<String>,
    generic_markers: Vec<String>,
}

impl ExceptionClassifier {
    pub fn new(startup_markers: Vec<String>, generic_markers: Vec<String>) -> Self {
        Self { startup_markers, generic_markers }
    }

    pub fn from_config(cfg: &FaultConfig) -> Self {
        Self::new(cfg.startup.clone(), cfg.generic.clone())
    }

    pub fn classify(&self, event: &LineEvent) -> Option<Fault> {
        match event {
            LineEvent::Line(line) => self.classify_text(&line.text),
            LineEvent::ReadFault { stream, error, .. } => Some(Fault {
                kind: FaultKind::Generic,
                message: format!("reading {} failed: {}", stream, error),
            }),
            LineEvent::Ended => None,
        }
    }

    pub fn classify_text(&self, text: &str) -> Option<Fault> {
        let kind = if contains_any(text, &self.startup_markers) {
            FaultKind::StartupFault
        } else if contains_any(text, &self.generic_markers) {
            FaultKind::Generic
        } else {
            return None;
        };
        Some(Fault { kind, message: text.to_string() })
    }
}

fn contains_any(text: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| !m.is_empty() && text.contains(m.as_str()))
}

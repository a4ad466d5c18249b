use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path, time::Duration};

use crate::error::SupervisorError;

fn default_marker() -> String { "started".to_string() }
fn default_timeout() -> u64 { 120 }
fn default_graceful() -> bool { true }
fn default_stoptime() -> u64 { 10 }
fn default_startup_markers() -> Vec<String> { vec!["StartupException".to_string()] }
fn default_generic_markers() -> Vec<String> { vec!["Exception in thread".to_string()] }
fn default_logs_dir() -> String { "logs".to_string() }
fn default_run_dir() -> String { "run".to_string() }


#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub workingdir: Option<String>,
    pub env: Option<HashMap<String, String>>,
    /// Executable name the running child is expected to carry.
    pub process_name: Option<String>,
}

impl ServiceConfig {
    /// Identity used for signal-target verification: `process_name`, or the
    /// file stem of `cmd`.
    pub fn expected_process_name(&self) -> String {
        if let Some(name) = &self.process_name {
            return name.clone();
        }
        Path::new(&self.cmd)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.cmd.clone())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReadinessConfig {
    pub component: String,
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub max_lines: Option<usize>,
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FaultConfig {
    #[serde(default = "default_startup_markers")]
    pub startup: Vec<String>,
    #[serde(default = "default_generic_markers")]
    pub generic: Vec<String>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self { startup: default_startup_markers(), generic: default_generic_markers() }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StopConfig {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
    #[serde(default = "default_stoptime")]
    pub stoptime: u64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self { graceful: default_graceful(), stoptime: default_stoptime() }
    }
}

impl StopConfig {
    pub fn stoptime(&self) -> Duration {
        Duration::from_secs(self.stoptime)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_logs_dir")]
    pub dir: String,
    #[serde(default = "default_run_dir")]
    pub run_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { dir: default_logs_dir(), run_dir: default_run_dir() }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub service: ServiceConfig,
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub faults: FaultConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub logs: LogConfig,
}

impl SupervisorConfig {
    /// Appends an already-validated startup argument list to the service args.
    pub fn with_extra_args<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service.args.extend(extra.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.service.name.trim().is_empty() {
            return Err(SupervisorError::Config("service.name must not be empty".into()));
        }
        if self.service.cmd.trim().is_empty() {
            return Err(SupervisorError::Config("service.cmd must not be empty".into()));
        }
        if self.readiness.component.trim().is_empty() {
            return Err(SupervisorError::Config("readiness.component must not be empty".into()));
        }
        if self.readiness.max_lines == Some(0) {
            return Err(SupervisorError::Config("readiness.max_lines must be at least 1".into()));
        }
        Ok(())
    }
}



/*
    @@@
    @parser();
    . Reads the content of the config file into a String. Any I/O error (file not found, permission denied, etc.) is returned as a Config error.
    . Hands the raw YAML text to serde_yaml, which maps it into SupervisorConfig, then validates the required fields.
*/
pub fn parser(path: &str) -> Result<SupervisorConfig, SupervisorError> {
    let yaml_file = fs::read_to_string(path)
        .map_err(|e| SupervisorError::Config(format!("cannot read {}: {}", path, e)))?;
    from_yaml(&yaml_file)
}

pub fn from_yaml(yaml: &str) -> Result<SupervisorConfig, SupervisorError> {
    let parsed_config: SupervisorConfig = serde_yaml::from_str(yaml)
        .map_err(|e| SupervisorError::Config(e.to_string()))?;
    parsed_config.validate()?;
    Ok(parsed_config)
}


#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
service:
  name: search
  cmd: /opt/search/bin/search-node
readiness:
  component: o.e.n.Node
"#;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let cfg = from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.readiness.marker, "started");
        assert_eq!(cfg.readiness.timeout(), Duration::from_secs(120));
        assert_eq!(cfg.readiness.max_lines, None);
        assert_eq!(cfg.faults.startup, vec!["StartupException"]);
        assert!(cfg.stop.graceful);
        assert_eq!(cfg.stop.stoptime, 10);
        assert_eq!(cfg.logs.dir, "logs");
        assert!(cfg.service.args.is_empty());
    }

    #[test]
    fn test_expected_process_name_defaults_to_cmd_stem() {
        let cfg = from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.service.expected_process_name(), "search-node");

        let mut named = cfg.service.clone();
        named.process_name = Some("java".into());
        assert_eq!(named.expected_process_name(), "java");
    }

    #[test]
    fn test_extra_args_are_appended() {
        let cfg = from_yaml(MINIMAL).unwrap().with_extra_args(["-Ecluster.name=a", "-d"]);
        assert_eq!(cfg.service.args, vec!["-Ecluster.name=a", "-d"]);
    }

    #[test]
    fn test_rejects_empty_component_and_zero_budget() {
        let empty = MINIMAL.replace("o.e.n.Node", "\"\"");
        assert!(matches!(from_yaml(&empty), Err(SupervisorError::Config(_))));

        let zero = format!("{}  max_lines: 0\n", MINIMAL);
        assert!(matches!(from_yaml(&zero), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = parser("does/not/exist.yml").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.yml"));
    }
}

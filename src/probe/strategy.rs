//! Readiness strategy declarations

use crate::error::{BerthError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

fn default_times() -> usize {
    1
}

/// How a started instance is judged ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitStrategy {
    /// A TCP connection to the mapped host port succeeds.
    /// `None` means the first exposed port of the service.
    PortOpen {
        #[serde(default)]
        port: Option<u16>,
    },
    /// The combined instance log matches `pattern` at least `times` times
    LogPatternMatch {
        pattern: String,
        #[serde(default = "default_times")]
        times: usize,
    },
    /// A command executed inside the instance exits with status 0
    CommandSucceeds { command: Vec<String> },
    /// The engine reports the instance as running
    Running,
}

impl WaitStrategy {
    /// Wait for the first exposed port to accept connections
    pub fn port_open() -> Self {
        WaitStrategy::PortOpen { port: None }
    }

    /// Wait for a specific declared port to accept connections
    pub fn port(port: u16) -> Self {
        WaitStrategy::PortOpen { port: Some(port) }
    }

    /// Wait for a log line matching `pattern`
    pub fn log_message(pattern: &str) -> Self {
        WaitStrategy::LogPatternMatch {
            pattern: pattern.to_string(),
            times: 1,
        }
    }

    /// Wait for `pattern` to appear `times` times in the log
    pub fn log_message_times(pattern: &str, times: usize) -> Self {
        WaitStrategy::LogPatternMatch {
            pattern: pattern.to_string(),
            times,
        }
    }

    /// Wait for a command to succeed inside the instance
    pub fn command<S: AsRef<str>>(command: &[S]) -> Self {
        WaitStrategy::CommandSucceeds {
            command: command.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Check that the strategy is usable for a service exposing `ports`
    pub fn validate(&self, ports: &[u16]) -> Result<()> {
        match self {
            WaitStrategy::PortOpen { port: Some(port) } => {
                if !ports.contains(port) {
                    return Err(BerthError::InvalidSpec(format!(
                        "wait strategy probes port {} which is not exposed",
                        port
                    )));
                }
            }
            WaitStrategy::PortOpen { port: None } => {
                if ports.is_empty() {
                    return Err(BerthError::InvalidSpec(
                        "port-open wait strategy requires an exposed port".to_string(),
                    ));
                }
            }
            WaitStrategy::LogPatternMatch { pattern, times } => {
                Regex::new(pattern).map_err(|e| {
                    BerthError::InvalidSpec(format!("invalid log pattern {:?}: {}", pattern, e))
                })?;
                if *times == 0 {
                    return Err(BerthError::InvalidSpec(
                        "log pattern must be expected at least once".to_string(),
                    ));
                }
            }
            WaitStrategy::CommandSucceeds { command } => {
                if command.is_empty() {
                    return Err(BerthError::InvalidSpec(
                        "readiness command must not be empty".to_string(),
                    ));
                }
            }
            WaitStrategy::Running => {}
        }
        Ok(())
    }
}

impl std::fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitStrategy::PortOpen { port: Some(port) } => write!(f, "port-open({})", port),
            WaitStrategy::PortOpen { port: None } => write!(f, "port-open"),
            WaitStrategy::LogPatternMatch { pattern, times } => {
                write!(f, "log-match({:?} x{})", pattern, times)
            }
            WaitStrategy::CommandSucceeds { command } => {
                write!(f, "command({})", command.join(" "))
            }
            WaitStrategy::Running => write!(f, "running"),
        }
    }
}

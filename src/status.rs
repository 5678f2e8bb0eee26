//! Service status and the events emitted on every transition.

use std::fmt;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ServiceStatus {
    /// Starting or Running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an unexpected exit happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrashKind {
    /// Exited before the startup timeout elapsed.
    StartupTimeoutCrash,
    /// Exited after having reached Running.
    RuntimeCrash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crash {
    pub kind: CrashKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl Crash {
    pub fn from_exit(kind: CrashKind, status: Option<ExitStatus>) -> Self {
        let exit_code = status.and_then(|s| s.code());
        Self {
            kind,
            exit_code,
            signal: status.and_then(exit_signal),
        }
    }
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            CrashKind::StartupTimeoutCrash => "exited during startup",
            CrashKind::RuntimeCrash => "exited unexpectedly",
        };
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "{what} (exit code {code})"),
            (None, Some(sig)) => write!(f, "{what} (signal {sig})"),
            (None, None) => f.write_str(what),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// One status transition of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub service: String,
    pub previous: ServiceStatus,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    /// Present on transitions into Error caused by a process exit.
    pub crash: Option<Crash>,
    pub ts: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(service: &str, previous: ServiceStatus, status: ServiceStatus, pid: Option<u32>) -> Self {
        Self {
            service: service.to_string(),
            previous,
            status,
            pid,
            crash: None,
            ts: Utc::now(),
        }
    }

    pub fn with_crash(mut self, crash: Crash) -> Self {
        self.crash = Some(crash);
        self
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} → {}", self.service, self.previous, self.status)?;
        if let Some(pid) = self.pid {
            write!(f, " (pid {pid})")?;
        }
        if let Some(crash) = &self.crash {
            write!(f, ": {crash}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_starting_and_running_are_active() {
        assert!(!ServiceStatus::Stopped.is_active());
        assert!(ServiceStatus::Starting.is_active());
        assert!(ServiceStatus::Running.is_active());
        assert!(!ServiceStatus::Error.is_active());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn crash_event_display_mentions_exit_code() {
        let crash = Crash {
            kind: CrashKind::RuntimeCrash,
            exit_code: Some(3),
            signal: None,
        };
        let event = StatusEvent::new("sdk", ServiceStatus::Running, ServiceStatus::Error, Some(42))
            .with_crash(crash);
        assert_eq!(
            event.to_string(),
            "sdk running → error (pid 42): exited unexpectedly (exit code 3)"
        );
    }
}

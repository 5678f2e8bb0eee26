#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use procwarden::config::RestartPolicy;
use procwarden::{ServiceSpec, ServiceStatus, StatusEvent, SupervisorSettings};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

/// Short timings so lifecycle tests finish quickly.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        startup_timeout_ms: 300,
        startup_poll_ms: 20,
        running_poll_ms: 20,
        stop_grace_ms: 2_000,
        restart_settle_ms: 50,
        batch_delay_ms: 0,
        restart_batch_delay_ms: 0,
        output_tail_lines: 50,
        restart: RestartPolicy::default(),
    }
}

pub fn sh(name: &str, script: &str) -> ServiceSpec {
    ServiceSpec::new(name, "/bin/sh").args(["-c", script])
}

/// A service that runs until told to stop.
pub fn long_running(name: &str) -> ServiceSpec {
    sh(name, "exec sleep 30")
}

/// Drain `rx` until `service` reports `status`.
pub fn wait_for(
    rx: &Receiver<StatusEvent>,
    service: &str,
    status: ServiceStatus,
) -> Option<StatusEvent> {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = rx.recv_timeout(left).ok()?;
        if event.service == service && event.status == status {
            return Some(event);
        }
    }
}

/// Every event received within `quiet` of the previous one.
pub fn drain(rx: &Receiver<StatusEvent>, quiet: Duration) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(quiet) {
        events.push(event);
    }
    events
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_config(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("procwarden.toml");
        fs::write(&path, content).unwrap();
        path
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}

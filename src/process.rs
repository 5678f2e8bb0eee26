//! Ownership of one spawned OS process.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::config::ServiceSpec;
use crate::error::SupervisorError;
use crate::lock;

/// Log target used for captured child output.
pub const OUTPUT_TARGET: &str = "procwarden::output";

const TERMINATE_POLL: Duration = Duration::from_millis(25);

/// Bounded tail of a process's stdout and stderr lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = lock(&self.lines);
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).iter().cloned().collect()
    }
}

/// Result of [`ProcessHandle::terminate`].
#[derive(Debug, Clone, Copy)]
pub struct Termination {
    pub status: Option<ExitStatus>,
    /// The grace period ran out and the process was killed.
    pub forced: bool,
}

/// A spawned child process, exclusively owned.
#[derive(Debug)]
pub struct ProcessHandle {
    service: String,
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    exit: Option<ExitStatus>,
    output: OutputTail,
}

impl ProcessHandle {
    /// Launch the service described by `spec`, capturing its output into `output`.
    pub fn spawn(spec: &ServiceSpec, output: OutputTail) -> Result<Self, SupervisorError> {
        if !spec.executable_exists() {
            return Err(SupervisorError::NotFound {
                service: spec.name().to_string(),
                path: spec.executable().to_path_buf(),
            });
        }

        let mut command = Command::new(spec.executable());
        command
            .args(spec.arguments())
            .current_dir(spec.cwd())
            .envs(spec.env_vars().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // own process group: a Ctrl-C aimed at the supervisor must not reach the services
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                service: spec.name().to_string(),
                source,
            })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            capture(spec.name(), "stdout", stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            capture(spec.name(), "stderr", stderr, output.clone());
        }

        info!(
            "spawned {} (pid {pid}): {} {}",
            spec.name(),
            spec.executable().display(),
            spec.arguments().join(" ")
        );

        Ok(Self {
            service: spec.name().to_string(),
            child,
            pid,
            started_at: Utc::now(),
            exit: None,
            output,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn output(&self) -> &OutputTail {
        &self.output
    }

    /// Exit status, once the process has been seen to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Non-blocking liveness check. Reaps the process if it has exited.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("{}: liveness check failed for pid {}: {e}", self.service, self.pid);
                true
            }
        }
    }

    /// Ask the process to stop, escalating to a forced kill after `grace`.
    pub fn terminate(&mut self, grace: Duration) -> Result<Termination, SupervisorError> {
        if !self.is_alive() {
            return Ok(Termination {
                status: self.exit,
                forced: false,
            });
        }

        let deadline = match send_graceful_stop(self.pid) {
            Ok(()) => Instant::now() + grace,
            Err(e) => {
                debug!("{}: graceful stop unavailable: {e}", self.service);
                Instant::now()
            }
        };
        while Instant::now() < deadline {
            if !self.is_alive() {
                debug!("{} (pid {}) stopped gracefully", self.service, self.pid);
                return Ok(Termination {
                    status: self.exit,
                    forced: false,
                });
            }
            thread::sleep(TERMINATE_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }

        if !self.is_alive() {
            return Ok(Termination {
                status: self.exit,
                forced: false,
            });
        }

        warn!(
            "{} (pid {}) did not stop within {:?}, killing",
            self.service, self.pid, grace
        );
        let status = self.kill()?;
        Ok(Termination {
            status: Some(status),
            forced: true,
        })
    }

    /// Forced kill, then reap.
    pub fn kill(&mut self) -> Result<ExitStatus, SupervisorError> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        if let Err(source) = self.child.kill() {
            // the process may have exited between the check and the kill
            if self.is_alive() {
                return Err(SupervisorError::Kill {
                    service: self.service.clone(),
                    pid: self.pid,
                    source,
                });
            }
        }
        self.wait()
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().map_err(|source| SupervisorError::Kill {
            service: self.service.clone(),
            pid: self.pid,
            source,
        })?;
        self.exit = Some(status);
        Ok(status)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!("{} (pid {}) dropped while alive, killing", self.service, self.pid);
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn send_graceful_stop(pid: u32) -> nix::Result<()> {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        }
    } else {
        fn send_graceful_stop(_pid: u32) -> std::io::Result<()> {
            Err(std::io::ErrorKind::Unsupported.into())
        }
    }
}

fn capture<R>(service: &str, stream: &'static str, reader: R, tail: OutputTail)
where
    R: Read + Send + 'static,
{
    let name = service.to_string();
    let spawned = thread::Builder::new()
        .name(format!("{service}-{stream}"))
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => {
                        info!(target: OUTPUT_TARGET, "[{name}] {line}");
                        tail.push(line);
                    }
                    Err(e) => {
                        debug!("{name}: {stream} closed: {e}");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("could not capture {stream} of {service}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_only_newest_lines() {
        let tail = OutputTail::new(2);
        tail.push("one".into());
        tail.push("two".into());
        tail.push("three".into());
        assert_eq!(tail.lines(), vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn zero_capacity_tail_stores_nothing() {
        let tail = OutputTail::new(0);
        tail.push("ignored".into());
        assert!(tail.lines().is_empty());
    }

    #[test]
    fn missing_executable_is_not_found() {
        let spec = ServiceSpec::new("ghost", "/definitely/not/here/ghost");
        let err = ProcessHandle::spawn(&spec, OutputTail::new(10)).unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_and_reports_exit() {
        let spec = ServiceSpec::new("echo", "/bin/sh").args(["-c", "echo hello; exit 3"]);
        let mut handle = ProcessHandle::spawn(&spec, OutputTail::new(10)).unwrap();
        let status = handle.wait().unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(!handle.is_alive());

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.output().lines().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.output().lines(), vec!["hello".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn terminate_escalates_when_term_is_ignored() {
        let spec = ServiceSpec::new("stubborn", "/bin/sh").args(["-c", "trap '' TERM; exec sleep 30"]);
        let mut handle = ProcessHandle::spawn(&spec, OutputTail::new(10)).unwrap();
        thread::sleep(Duration::from_millis(100));

        let result = handle.terminate(Duration::from_millis(200)).unwrap();
        assert!(result.forced);
        assert!(!handle.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn terminate_is_graceful_for_cooperative_process() {
        let spec = ServiceSpec::new("polite", "/bin/sh").args(["-c", "exec sleep 30"]);
        let mut handle = ProcessHandle::spawn(&spec, OutputTail::new(10)).unwrap();
        assert!(handle.is_alive());

        let result = handle.terminate(Duration::from_secs(5)).unwrap();
        assert!(!result.forced);
        assert!(!handle.is_alive());
    }
}

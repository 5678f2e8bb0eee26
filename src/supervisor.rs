use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bus::StatusBus;
use crate::config::{ServiceConfig, ServiceSpec, SupervisorSettings, validate_specs};
use crate::error::{Result, SupervisorError};
use crate::lock;
use crate::monitor::{self, Cmd, MonitorSlot};
use crate::process::{OutputTail, ProcessHandle, Termination};
use crate::status::{Crash, ServiceStatus, StatusEvent};

const LAUNCH_POLL: Duration = Duration::from_millis(5);

/// Outcome of a successful [`Supervisor::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// Already Starting or Running; nothing was spawned.
    AlreadyActive,
}

/// Outcome of a successful [`Supervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    /// `forced` is set when the grace period expired and the process was killed.
    Stopped { forced: bool },
}

/// Per-service results of a batch operation, in the order attempted.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<(String, Result<T>)>,
}

impl<T> BatchReport<T> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &SupervisorError)> {
        self.results
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub display_name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub executable: PathBuf,
    pub executable_exists: bool,
    pub last_crash: Option<Crash>,
}

pub(crate) struct ProcessRecord {
    pub(crate) spec: ServiceSpec,
    pub(crate) status: ServiceStatus,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) pid: Option<u32>,
    /// Owns the process handle while the service is active.
    pub(crate) monitor: Option<MonitorSlot>,
    /// A spawn is in flight outside the lock.
    pub(crate) launching: bool,
    pub(crate) stop_requested: bool,
    pub(crate) run_id: u64,
    pub(crate) last_crash: Option<Crash>,
    pub(crate) output: Option<OutputTail>,
}

impl ProcessRecord {
    fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            status: ServiceStatus::Stopped,
            started_at: None,
            pid: None,
            monitor: None,
            launching: false,
            stop_requested: false,
            run_id: 0,
            last_crash: None,
            output: None,
        }
    }

    /// Change status and build the event describing it. The caller publishes
    /// it while still holding the record lock so events stay in order.
    pub(crate) fn transition(&mut self, status: ServiceStatus) -> StatusEvent {
        let event = StatusEvent::new(self.spec.name(), self.status, status, self.pid);
        self.status = status;
        event
    }

    pub(crate) fn release_process(&mut self) {
        self.pid = None;
        self.started_at = None;
        self.stop_requested = false;
    }

    fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            name: self.spec.name().to_string(),
            display_name: self.spec.label().to_string(),
            status: self.status,
            pid: self.pid,
            started_at: self.started_at,
            executable: self.spec.executable().to_path_buf(),
            executable_exists: self.spec.executable_exists(),
            last_crash: self.last_crash.clone(),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) records: Mutex<HashMap<String, ProcessRecord>>,
    pub(crate) bus: StatusBus,
    pub(crate) settings: SupervisorSettings,
    order: Vec<String>,
}

/// Starts, stops and watches a fixed set of services.
///
/// Cloning is cheap and every clone drives the same services. `stop`,
/// `restart` and the batch operations block for up to the grace period and
/// configured delays; call them from a thread that may block.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Every service starts out Stopped. Names must be non-empty and unique.
    pub fn new(specs: Vec<ServiceSpec>, settings: SupervisorSettings) -> Result<Self> {
        validate_specs(&specs)?;

        let order = specs.iter().map(|s| s.name().to_string()).collect();
        let records = specs
            .into_iter()
            .map(|spec| (spec.name().to_string(), ProcessRecord::new(spec)))
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                records: Mutex::new(records),
                bus: StatusBus::new()?,
                settings,
                order,
            }),
        })
    }

    /// Build from a loaded config whose relative paths are based at `base_dir`.
    pub fn from_config(cfg: &ServiceConfig, base_dir: &Path) -> Result<Self> {
        Self::new(cfg.specs(base_dir)?, cfg.supervisor.clone())
    }

    pub fn bus(&self) -> &StatusBus {
        &self.shared.bus
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Service names in configuration order.
    pub fn services(&self) -> &[String] {
        &self.shared.order
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.shared.records).contains_key(name)
    }

    pub fn start(&self, name: &str) -> Result<StartOutcome> {
        let (spec, output) = {
            let mut records = lock(&self.shared.records);
            let record = records
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
            if record.launching || record.status.is_active() {
                debug!("{name} is {}, start is a no-op", record.status);
                return Ok(StartOutcome::AlreadyActive);
            }
            record.launching = true;
            (
                record.spec.clone(),
                OutputTail::new(self.shared.settings.output_tail_lines),
            )
        };

        let spawned = ProcessHandle::spawn(&spec, output.clone());

        let mut records = lock(&self.shared.records);
        let record = records
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
        record.launching = false;

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("{e}");
                return Err(e);
            }
        };

        let pid = handle.pid();
        record.run_id += 1;
        record.stop_requested = false;
        record.pid = Some(pid);
        record.started_at = Some(handle.started_at());
        record.output = Some(output);
        record.last_crash = None;

        match monitor::launch(
            Arc::downgrade(&self.shared),
            self.shared.settings.clone(),
            name.to_string(),
            record.run_id,
            handle,
        ) {
            Ok(slot) => record.monitor = Some(slot),
            Err(source) => {
                // the handle went down with the failed thread and killed its child
                record.release_process();
                return Err(SupervisorError::Monitor {
                    service: name.to_string(),
                    source,
                });
            }
        }

        let event = record.transition(ServiceStatus::Starting);
        self.shared.bus.publish(event);
        info!("{name} starting (pid {pid})");
        Ok(StartOutcome::Started { pid })
    }

    /// Idempotent. Blocks for up to the configured grace period, and for an
    /// in-flight spawn of the same service to finish.
    pub fn stop(&self, name: &str) -> Result<StopOutcome> {
        let slot = loop {
            let mut records = lock(&self.shared.records);
            let record = records
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;

            if record.launching {
                drop(records);
                thread::sleep(LAUNCH_POLL);
                continue;
            }

            break match record.monitor.take() {
                Some(slot) => {
                    record.stop_requested = true;
                    slot
                }
                None if record.stop_requested || record.status == ServiceStatus::Stopped => {
                    debug!("{name} already stopped or stopping");
                    return Ok(StopOutcome::AlreadyStopped);
                }
                None => {
                    let event = record.transition(ServiceStatus::Stopped);
                    record.release_process();
                    self.shared.bus.publish(event);
                    info!("{name} stopped");
                    return Ok(StopOutcome::Stopped { forced: false });
                }
            };
        };

        let result = request_stop(&slot, self.shared.settings.stop_grace());
        if slot.join.join().is_err() {
            error!("monitor for {name} panicked");
        }

        let mut records = lock(&self.shared.records);
        let record = records
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;

        match result {
            Ok(termination) => {
                let event = record.transition(ServiceStatus::Stopped);
                record.release_process();
                self.shared.bus.publish(event);
                if termination.forced {
                    info!("{name} stopped (killed after grace period)");
                } else {
                    info!("{name} stopped");
                }
                Ok(StopOutcome::Stopped {
                    forced: termination.forced,
                })
            }
            Err(e) => {
                error!("{e}");
                let event = record.transition(ServiceStatus::Error);
                record.release_process();
                self.shared.bus.publish(event);
                Err(e)
            }
        }
    }

    /// Stop, wait the settle delay, start again.
    pub fn restart(&self, name: &str) -> Result<StartOutcome> {
        self.stop(name)?;
        let settle = self.shared.settings.restart_settle();
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        self.start(name)
    }

    pub fn status(&self, name: &str) -> Result<ServiceStatus> {
        lock(&self.shared.records)
            .get(name)
            .map(|r| r.status)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    /// Status of every service in configuration order.
    pub fn statuses(&self) -> Vec<(String, ServiceStatus)> {
        let records = lock(&self.shared.records);
        self.shared
            .order
            .iter()
            .filter_map(|name| records.get(name).map(|r| (name.clone(), r.status)))
            .collect()
    }

    pub fn snapshot(&self, name: &str) -> Result<ServiceSnapshot> {
        lock(&self.shared.records)
            .get(name)
            .map(ProcessRecord::snapshot)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let records = lock(&self.shared.records);
        self.shared
            .order
            .iter()
            .filter_map(|name| records.get(name).map(ProcessRecord::snapshot))
            .collect()
    }

    /// Captured stdout/stderr of the current or most recent process.
    pub fn recent_output(&self, name: &str) -> Result<Vec<String>> {
        lock(&self.shared.records)
            .get(name)
            .map(|r| r.output.as_ref().map(OutputTail::lines).unwrap_or_default())
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    /// Whether any service is Starting, Running or being launched.
    pub fn any_active(&self) -> bool {
        lock(&self.shared.records)
            .values()
            .any(|r| r.launching || r.status.is_active())
    }

    pub fn start_all(&self) -> BatchReport<StartOutcome> {
        let names = self.shared.order.clone();
        self.start_many(&names)
    }

    /// Start the named services in the given order.
    pub fn start_many(&self, names: &[String]) -> BatchReport<StartOutcome> {
        self.batch(names, self.shared.settings.batch_delay(), |name| self.start(name))
    }

    pub fn stop_all(&self) -> BatchReport<StopOutcome> {
        let names = self.shared.order.clone();
        self.batch(&names, self.shared.settings.batch_delay(), |name| self.stop(name))
    }

    pub fn restart_all(&self, names: &[String]) -> BatchReport<StartOutcome> {
        self.batch(names, self.shared.settings.restart_batch_delay(), |name| {
            self.restart(name)
        })
    }

    /// Stop everything; for frontends on their way out.
    pub fn shutdown(&self) -> BatchReport<StopOutcome> {
        info!("stopping all services");
        self.stop_all()
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn batch<T, F>(&self, names: &[String], delay: Duration, op: F) -> BatchReport<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let mut results = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                thread::sleep(delay);
            }
            let result = op(name);
            if let Err(e) = &result {
                warn!("{name}: {e}");
            }
            results.push((name.clone(), result));
        }
        BatchReport { results }
    }
}

fn request_stop(slot: &MonitorSlot, grace: Duration) -> Result<Termination> {
    let finished = Termination {
        status: None,
        forced: false,
    };
    let (reply_tx, reply_rx) = bounded(1);
    if slot.cmd_tx.send(Cmd::Stop { grace, reply: reply_tx }).is_err() {
        // monitor already gone, and its handle with it
        return Ok(finished);
    }
    reply_rx.recv().unwrap_or(Ok(finished))
}

//! Per-process monitor thread.
//!
//! The monitor owns the [`ProcessHandle`] from spawn to exit. It polls
//! liveness on a ticker, promotes Starting to Running once the startup
//! timeout passes, and reports unexpected exits as Error. Stop requests
//! arrive on its command channel; the supervisor raises `stop_requested`
//! under the record lock before sending one, and the monitor checks that
//! flag under the same lock before committing Error, so an explicit stop
//! always wins over a concurrently detected exit.
//!
//! Monitors only hold a weak reference to the supervisor state. Once the
//! last `Supervisor` is dropped the command channel disconnects and the
//! monitor terminates its process.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use log::{debug, error, info, warn};

use crate::config::SupervisorSettings;
use crate::error::SupervisorError;
use crate::lock;
use crate::process::{ProcessHandle, Termination};
use crate::status::{Crash, CrashKind, ServiceStatus};
use crate::supervisor::Shared;

pub(crate) enum Cmd {
    Stop {
        grace: Duration,
        reply: Sender<Result<Termination, SupervisorError>>,
    },
}

/// Supervisor's end of a running monitor.
pub(crate) struct MonitorSlot {
    pub(crate) cmd_tx: Sender<Cmd>,
    pub(crate) join: JoinHandle<()>,
}

pub(crate) fn launch(
    shared: Weak<Shared>,
    settings: SupervisorSettings,
    service: String,
    run_id: u64,
    handle: ProcessHandle,
) -> io::Result<MonitorSlot> {
    let (cmd_tx, cmd_rx) = unbounded();
    let monitor = Monitor {
        shared,
        settings,
        service: service.clone(),
        run_id,
        handle,
        cmd_rx,
    };
    let join = thread::Builder::new()
        .name(format!("monitor-{service}"))
        .spawn(move || monitor.run())?;
    Ok(MonitorSlot { cmd_tx, join })
}

struct Monitor {
    shared: Weak<Shared>,
    settings: SupervisorSettings,
    service: String,
    run_id: u64,
    handle: ProcessHandle,
    cmd_rx: Receiver<Cmd>,
}

impl Monitor {
    fn run(mut self) {
        let settings = self.settings.clone();
        let deadline = Instant::now() + settings.startup_timeout();
        let mut ticker = tick(settings.startup_poll());
        let mut running = false;

        loop {
            let mut promote = false;
            select! {
                recv(self.cmd_rx) -> cmd => {
                    match cmd {
                        Ok(Cmd::Stop { grace, reply }) => {
                            let result = self.handle.terminate(grace);
                            reply.send(result).ok();
                        }
                        Err(_) => {
                            warn!("{}: supervisor dropped, stopping pid {}", self.service, self.handle.pid());
                            if let Err(e) = self.handle.terminate(settings.stop_grace()) {
                                error!("{}: {e}", self.service);
                            }
                        }
                    }
                    return;
                }
                recv(ticker) -> _ => {
                    if !self.handle.is_alive() {
                        if !self.commit_exit(running) {
                            self.await_stop();
                        }
                        return;
                    }
                    if !running && Instant::now() >= deadline {
                        promote = self.commit_running();
                    }
                }
            }
            if promote {
                running = true;
                ticker = tick(settings.running_poll());
            }
        }
    }

    fn commit_running(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut records = lock(&shared.records);
        let Some(record) = records.get_mut(&self.service) else {
            return false;
        };
        if record.run_id != self.run_id
            || record.stop_requested
            || record.status != ServiceStatus::Starting
        {
            return false;
        }
        let event = record.transition(ServiceStatus::Running);
        shared.bus.publish(event);
        info!("{} running (pid {})", self.service, self.handle.pid());
        true
    }

    /// Returns false when a stop is pending; the exit then belongs to it.
    fn commit_exit(&self, running: bool) -> bool {
        let kind = if running {
            CrashKind::RuntimeCrash
        } else {
            CrashKind::StartupTimeoutCrash
        };
        let crash = Crash::from_exit(kind, self.handle.exit_status());

        let Some(shared) = self.shared.upgrade() else {
            return true;
        };
        let mut records = lock(&shared.records);
        let Some(record) = records.get_mut(&self.service) else {
            return true;
        };
        if record.run_id != self.run_id {
            debug!("{}: stale monitor for run {} exiting", self.service, self.run_id);
            return true;
        }
        if record.stop_requested {
            debug!("{}: exit observed while stop pending", self.service);
            return false;
        }

        // dropping our own slot detaches this thread
        record.monitor = None;
        let event = record.transition(ServiceStatus::Error).with_crash(crash.clone());
        record.release_process();
        record.last_crash = Some(crash.clone());
        shared.bus.publish(event);
        error!("{} {crash}", self.service);
        true
    }

    fn await_stop(&self) {
        if let Ok(Cmd::Stop { reply, .. }) = self.cmd_rx.recv() {
            reply
                .send(Ok(Termination {
                    status: self.handle.exit_status(),
                    forced: false,
                }))
                .ok();
        }
    }
}

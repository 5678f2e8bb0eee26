//! Optional restart-on-crash policy, layered on top of the status bus.
//!
//! The supervisor core never restarts anything by itself. An [`AutoRestarter`]
//! watches for crash events and schedules a start after the configured delay,
//! giving up on a service after `max_attempts` consecutive crashes. Reaching
//! Running resets the count; an explicit stop cancels a pending restart.

use std::collections::HashMap;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select, tick};
use log::{error, info, warn};

use crate::bus::ObserverId;
use crate::config::RestartPolicy;
use crate::error::SupervisorError;
use crate::status::{ServiceStatus, StatusEvent};
use crate::supervisor::{Shared, StartOutcome, Supervisor};

const RESTART_TICK: Duration = Duration::from_millis(100);

/// Restart state for a service
#[derive(Debug)]
struct RestartState {
    due: Instant,
    attempt: u32,
}

pub struct AutoRestarter {
    supervisor: Weak<Shared>,
    observer: ObserverId,
    worker: Option<JoinHandle<()>>,
}

impl AutoRestarter {
    /// Start watching `supervisor`. Only a weak reference is kept.
    pub fn attach(supervisor: &Supervisor, policy: RestartPolicy) -> Result<Self, SupervisorError> {
        let sub = supervisor.bus().subscribe_all();
        let weak = supervisor.downgrade();
        let worker_weak = weak.clone();

        let worker = thread::Builder::new()
            .name("auto-restart".into())
            .spawn(move || run(worker_weak, sub.events, policy))
            .map_err(|source| SupervisorError::Monitor {
                service: "auto-restart".into(),
                source,
            })?;

        Ok(Self {
            supervisor: weak,
            observer: sub.id,
            worker: Some(worker),
        })
    }

    /// Stop watching and wait for the worker to finish.
    pub fn detach(mut self) {
        self.unregister();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }

    fn unregister(&self) {
        if let Some(shared) = self.supervisor.upgrade() {
            Supervisor::from_shared(shared).bus().unregister(self.observer);
        }
    }
}

impl Drop for AutoRestarter {
    fn drop(&mut self) {
        // the worker exits on its own once its event channel disconnects
        if self.worker.is_some() {
            self.unregister();
        }
    }
}

fn run(supervisor: Weak<Shared>, events: Receiver<StatusEvent>, policy: RestartPolicy) {
    let mut pending: HashMap<String, RestartState> = HashMap::new();
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let restart_tick = tick(RESTART_TICK);

    loop {
        select! {
            recv(events) -> evt => match evt {
                Ok(evt) => handle_event(&evt, &policy, &mut pending, &mut attempts),
                Err(_) => break,
            },
            recv(restart_tick) -> _ => {
                if !process_pending_restarts(&supervisor, &mut pending) {
                    break;
                }
            }
        }
    }
}

fn handle_event(
    evt: &StatusEvent,
    policy: &RestartPolicy,
    pending: &mut HashMap<String, RestartState>,
    attempts: &mut HashMap<String, u32>,
) {
    match evt.status {
        ServiceStatus::Running => {
            attempts.remove(&evt.service);
        }
        ServiceStatus::Stopped => {
            attempts.remove(&evt.service);
            if pending.remove(&evt.service).is_some() {
                info!("{} stopped, pending restart cancelled", evt.service);
            }
        }
        ServiceStatus::Error if evt.crash.is_some() => {
            let attempt = attempts.get(&evt.service).copied().unwrap_or(0) + 1;
            if attempt > policy.max_attempts {
                error!(
                    "{} crashed {} times in a row, not restarting",
                    evt.service, policy.max_attempts
                );
                return;
            }
            attempts.insert(evt.service.clone(), attempt);
            pending.insert(
                evt.service.clone(),
                RestartState {
                    due: Instant::now() + policy.delay(),
                    attempt,
                },
            );
            info!(
                "Scheduled restart for {} in {:?} (attempt #{attempt})",
                evt.service,
                policy.delay()
            );
        }
        _ => {}
    }
}

/// Returns false once the supervisor is gone.
fn process_pending_restarts(
    supervisor: &Weak<Shared>,
    pending: &mut HashMap<String, RestartState>,
) -> bool {
    let now = Instant::now();
    let ready: Vec<String> = pending
        .iter()
        .filter(|(_, state)| now >= state.due)
        .map(|(service, _)| service.clone())
        .collect();
    if ready.is_empty() {
        return true;
    }

    let Some(shared) = supervisor.upgrade() else {
        return false;
    };
    let supervisor = Supervisor::from_shared(shared);

    for service in ready {
        let Some(state) = pending.remove(&service) else {
            continue;
        };
        // someone else already acted on it
        if !matches!(supervisor.status(&service), Ok(ServiceStatus::Error)) {
            continue;
        }
        info!("Restarting {service} (attempt #{})", state.attempt);
        match supervisor.start(&service) {
            Ok(StartOutcome::Started { .. }) | Ok(StartOutcome::AlreadyActive) => {}
            Err(e) => warn!("automatic restart of {service} failed: {e}"),
        }
    }
    true
}

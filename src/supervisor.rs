//! The supervision engine.
//!
//! Owns the service table, the start order, and the periodic instance
//! table. All mutation happens on the main loop thread; pump threads only
//! touch the output sink. The loop polls service liveness, restarts exits,
//! reaps finished periodics, ticks the cron scheduler once per wall-clock
//! minute, and runs the termination ladder on shutdown.

use anyhow::Result;
use chrono::Local;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::child::{self, ChildHandle, ChildSpec};
use crate::config::{Config, ServiceSpec};
use crate::output::OutputSink;
use crate::periodic::{self, PeriodicEntry, PeriodicInstance};
use crate::signals;

const LOOP_TICK: Duration = Duration::from_millis(200);
const LADDER_POLL: Duration = Duration::from_millis(50);

/// The termination ladder: signal, then grace period, escalating.
const ESCALATION: [(libc::c_int, &str, u64); 4] = [
    (libc::SIGINT, "INT", 1000),
    (libc::SIGINT, "INT", 1000),
    (libc::SIGTERM, "TERM", 2000),
    (libc::SIGKILL, "KILL", 2000),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running,
    Stopping,
}

/// One supervised service. Lives for the supervisor's whole lifetime; the
/// child inside is replaced on every restart.
struct ServiceRecord {
    spec: ServiceSpec,
    child: Option<ChildHandle>,
    pump: Option<JoinHandle<()>>,
    state: ServiceState,
}

pub struct Supervisor {
    services: IndexMap<String, ServiceRecord>,
    /// Names in the order services were first started; shutdown walks this
    /// in reverse. Restarts do not change it.
    service_order: Vec<String>,
    periodics: Vec<PeriodicEntry>,
    instances: Vec<PeriodicInstance>,
    sink: OutputSink,
    last_minute: i64,
}

impl Supervisor {
    /// Build the runtime tables from the loaded configuration. Cron
    /// expressions were validated at load; entries with an empty `timing`
    /// are dropped here.
    pub fn new(config: &Config, sink: OutputSink) -> Result<Self> {
        let services = config
            .services
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    ServiceRecord {
                        spec: spec.clone(),
                        child: None,
                        pump: None,
                        state: ServiceState::Stopped,
                    },
                )
            })
            .collect();

        let mut periodics = Vec::new();
        for (name, spec) in &config.periodic {
            if spec.timing.is_empty() {
                continue;
            }
            periodics.push(PeriodicEntry {
                name: name.clone(),
                schedule: periodic::parse_schedule(&spec.timing)?,
                spec: spec.clone(),
            });
        }

        Ok(Supervisor {
            services,
            service_order: Vec::new(),
            periodics,
            instances: Vec::new(),
            sink,
            // Periodics first fire on the next minute boundary, never in the
            // minute the supervisor starts.
            last_minute: Local::now().timestamp() / 60,
        })
    }

    /// Run until a shutdown signal arrives, then drain everything.
    pub fn run(&mut self) -> Result<()> {
        self.start_services()?;
        while !signals::shutdown_requested() {
            self.reap_zombies();
            self.poll_services();
            self.reap_periodics();
            self.tick_cron();
            std::thread::sleep(LOOP_TICK);
        }
        signals::ignore_further();
        self.shutdown();
        Ok(())
    }

    /// Dependency-ordered startup: services start wave by wave, each wave
    /// being one pass over the declared order.
    fn start_services(&mut self) -> Result<()> {
        let needs: IndexMap<String, Vec<String>> = self
            .services
            .iter()
            .map(|(name, record)| (name.clone(), record.spec.needs.clone()))
            .collect();
        for wave in plan_waves(&needs)? {
            for name in wave {
                self.start_service(&name);
                self.service_order.push(name);
            }
        }
        Ok(())
    }

    /// Spawn (or re-spawn) one service. A spawn failure is logged and left
    /// as an immediate exit: the record stays `Running` with no child, and
    /// the next poll pass restarts it.
    fn start_service(&mut self, name: &str) {
        let Some(record) = self.services.get_mut(name) else {
            return;
        };
        info!("Starting service: {name}");
        match child::spawn(&ChildSpec::from(&record.spec)) {
            Ok((handle, reader)) => {
                record.pump =
                    reader.map(|r| child::spawn_pump(r, self.sink.clone(), name.to_string()));
                record.child = Some(handle);
                record.state = ServiceState::Running;
            }
            Err(err) => {
                warn!("Failed to start service {name}: {err:#}");
                record.pump = None;
                record.child = None;
                record.state = ServiceState::Running;
            }
        }
    }

    /// PID-1 duty: collect every zombie waiting on us. Statuses belonging
    /// to tracked children are stashed on their handles so the records'
    /// own poll/wait still observe them; the rest were orphans.
    fn reap_zombies(&mut self) {
        for (pid, status) in signals::drain_zombies() {
            let service = self
                .services
                .values_mut()
                .find(|record| record.child.as_ref().is_some_and(|c| c.pid() == pid));
            if let Some(record) = service {
                if let Some(handle) = record.child.as_mut() {
                    handle.note_reaped(status);
                }
            } else if let Some(instance) =
                self.instances.iter_mut().find(|i| i.child.pid() == pid)
            {
                instance.child.note_reaped(status);
            } else {
                debug!("Reaped orphan process {pid}");
            }
        }
    }

    /// Detect exited services and restart them in place. Restarts are
    /// immediate and unbounded; the start order is preserved.
    fn poll_services(&mut self) {
        for name in self.service_order.clone() {
            let Some(record) = self.services.get_mut(&name) else {
                continue;
            };
            if record.state != ServiceState::Running {
                continue;
            }

            let exited = match record.child.as_mut() {
                None => true, // previous spawn failed; retry now
                Some(handle) => match handle.poll() {
                    Ok(None) => false,
                    Ok(Some(status)) => {
                        warn!("Service unexpectedly stopped: {name} ({status})");
                        true
                    }
                    Err(err) => {
                        warn!("Service poll failed for {name}: {err:#}");
                        true
                    }
                },
            };
            if !exited {
                continue;
            }

            if let Some(mut handle) = record.child.take() {
                let _ = handle.wait();
            }
            if let Some(pump) = record.pump.take() {
                let _ = pump.join();
            }
            self.start_service(&name);
        }
    }

    /// Remove finished periodic instances: wait, join the pump, drop the
    /// record.
    fn reap_periodics(&mut self) {
        let mut finished = Vec::new();
        for (idx, instance) in self.instances.iter_mut().enumerate() {
            match instance.child.poll() {
                Ok(Some(_)) => finished.push(idx),
                Ok(None) => {}
                Err(err) => {
                    warn!("Periodic poll failed for {}: {err:#}", instance.key);
                    finished.push(idx);
                }
            }
        }
        for idx in finished.into_iter().rev() {
            let mut instance = self.instances.remove(idx);
            let status = instance.child.wait();
            if let Some(pump) = instance.pump.take() {
                let _ = pump.join();
            }
            match status {
                Ok(status) => info!(
                    "Periodic task finished: {} ({status}, ran {}s)",
                    instance.key,
                    instance.started_at.elapsed().as_secs()
                ),
                Err(err) => warn!("Periodic reap failed for {}: {err:#}", instance.key),
            }
        }
    }

    /// Evaluate cron schedules once per wall-clock minute.
    fn tick_cron(&mut self) {
        let now = Local::now();
        let minute = now.timestamp() / 60;
        if minute == self.last_minute {
            return;
        }
        self.last_minute = minute;

        for idx in 0..self.periodics.len() {
            let entry = &self.periodics[idx];
            if !periodic::matches_minute(&entry.schedule, now) {
                continue;
            }
            if !entry.spec.allow_multiple
                && self.instances.iter().any(|i| i.name == entry.name)
            {
                warn!("Periodic task still running, skipping: {}", entry.name);
                continue;
            }

            // The key names the individual instance in lifecycle logs; with
            // allow-multiple it carries a ULID suffix so concurrent runs
            // stay distinguishable.
            let key = periodic::instance_key(&entry.name, entry.spec.allow_multiple);
            info!("Starting periodic task: {key}");
            match child::spawn(&ChildSpec::from(&entry.spec)) {
                Ok((handle, reader)) => {
                    let pump = reader
                        .map(|r| child::spawn_pump(r, self.sink.clone(), entry.name.clone()));
                    self.instances.push(PeriodicInstance {
                        key,
                        name: entry.name.clone(),
                        child: handle,
                        pump,
                        started_at: Instant::now(),
                    });
                }
                Err(err) => warn!("Failed to start periodic task {key}: {err:#}"),
            }
        }
    }

    /// Drain every child: services in reverse start order, then live
    /// periodics. Reverse start order guarantees a service stops only after
    /// everything that needed it has stopped.
    fn shutdown(&mut self) {
        info!("Shutting down");
        for name in self.service_order.clone().into_iter().rev() {
            let Some(record) = self.services.get_mut(&name) else {
                continue;
            };
            record.state = ServiceState::Stopping;
            if let Some(mut handle) = record.child.take() {
                info!("Stopping service: {name}");
                terminate(&mut handle, &name);
            }
            if let Some(pump) = record.pump.take() {
                let _ = pump.join();
            }
            record.state = ServiceState::Stopped;
        }

        for mut instance in std::mem::take(&mut self.instances) {
            info!("Stopping periodic task: {}", instance.key);
            terminate(&mut instance.child, &instance.key);
            if let Some(pump) = instance.pump.take() {
                let _ = pump.join();
            }
        }
    }
}

/// Apply the termination ladder to one child, then reap it unconditionally.
fn terminate(handle: &mut ChildHandle, name: &str) {
    'ladder: for (signum, signame, grace_ms) in ESCALATION {
        if matches!(handle.poll(), Ok(Some(_))) {
            break;
        }
        debug!("Sending SIG{signame} to {name}");
        if handle.signal(signum).is_err() {
            break;
        }
        let deadline = Instant::now() + Duration::from_millis(grace_ms);
        while Instant::now() < deadline {
            if matches!(handle.poll(), Ok(Some(_))) {
                break 'ladder;
            }
            std::thread::sleep(LADDER_POLL);
        }
    }
    match handle.wait() {
        Ok(status) => debug!("Stopped {name} ({status})"),
        Err(err) => warn!("Reap failed for {name}: {err:#}"),
    }
}

/// Compute the startup waves. One wave is a single pass over the declared
/// order starting every not-yet-started service whose needs have all been
/// started (including earlier in the same pass). A pass that starts
/// nothing while services remain is an unsatisfiable dependency set.
pub fn plan_waves(needs: &IndexMap<String, Vec<String>>) -> Result<Vec<Vec<String>>> {
    let mut started: HashSet<String> = HashSet::new();
    let mut waves = Vec::new();
    while started.len() < needs.len() {
        let mut wave = Vec::new();
        for (name, deps) in needs {
            if started.contains(name) {
                continue;
            }
            if deps.iter().all(|dep| started.contains(dep)) {
                started.insert(name.clone());
                wave.push(name.clone());
            }
        }
        if wave.is_empty() {
            let stuck: Vec<&str> = needs
                .keys()
                .filter(|name| !started.contains(name.as_str()))
                .map(String::as_str)
                .collect();
            anyhow::bail!("unsatisfiable service dependencies: {}", stuck.join(", "));
        }
        waves.push(wave);
    }
    Ok(waves)
}

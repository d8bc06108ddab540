use crate::classify::{LogEvent, OutputClassifier};
use crate::config::{ArtifactSettings, Config, ReadinessSettings};
use crate::docker::failure_error;
use crate::docker::CommandOutput;
use crate::engine::Engine;
use crate::error::{HarnessError, Result};
use crate::journal::Journal;
use crate::router::{LogQueue, LogRouter};
use crate::wait::{wait_until, Probe, WaitPolicy};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// What bring-up established: the per-service queues and the container of
/// every service.
#[derive(Debug)]
pub struct Runtime {
    router: Arc<LogRouter>,
    containers: BTreeMap<String, String>,
}

impl Runtime {
    pub fn router(&self) -> &LogRouter {
        &self.router
    }

    pub fn containers(&self) -> &BTreeMap<String, String> {
        &self.containers
    }
}

pub struct Supervisor {
    engine: Engine,
    classifier: OutputClassifier,
    readiness: ReadinessSettings,
    pin_hosts_in: Vec<String>,
    artifacts: ArtifactSettings,
    journal: Arc<Journal>,
    runtime: OnceLock<Runtime>,
    reader: Mutex<Option<JoinHandle<Result<()>>>>,
    stopped: AtomicBool,
}

impl Supervisor {
    pub fn new(engine: Engine, cfg: &Config, journal: Arc<Journal>) -> Self {
        let classifier = OutputClassifier::new(engine.project());
        Self {
            engine,
            classifier,
            readiness: cfg.readiness.clone(),
            pin_hosts_in: cfg.docker.pin_hosts_in.clone(),
            artifacts: cfg.artifacts.clone(),
            journal,
            runtime: OnceLock::new(),
            reader: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn classifier(&self) -> &OutputClassifier {
        &self.classifier
    }

    pub fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .get()
            .ok_or_else(|| HarnessError::Misuse("environment has not been started".to_string()))
    }

    pub fn services(&self) -> Result<&[String]> {
        Ok(self.runtime()?.router.services())
    }

    pub fn containers(&self) -> Result<&BTreeMap<String, String>> {
        Ok(&self.runtime()?.containers)
    }

    pub fn container(&self, service: &str) -> Result<&str> {
        self.containers()?
            .get(service)
            .map(String::as_str)
            .ok_or_else(|| HarnessError::UnknownService(service.to_string()))
    }

    pub fn queue(&self, service: &str) -> Result<Arc<LogQueue>> {
        self.runtime()?.router.queue(service)
    }

    /// Brings the environment up and returns once every service container is
    /// known and running.
    pub fn start(&self) -> Result<()> {
        if self.runtime.get().is_some() || self.reader_slot()?.is_some() {
            return Err(HarnessError::Misuse(
                "environment already started".to_string(),
            ));
        }

        // leftovers from earlier runs confuse the container lookups below
        self.journal
            .timed("Cleaning up previous environment", || self.engine.down())?;

        let services = self.engine.declared_services()?;
        info!(?services, "declared services");
        self.journal.record("services", &services);
        let router = Arc::new(LogRouter::new(&services));

        let (ready_tx, ready_rx) = mpsc::channel();
        let bring_up = BringUp {
            engine: self.engine.clone(),
            classifier: self.classifier.clone(),
            readiness: self.readiness.clone(),
            journal: Arc::clone(&self.journal),
            router: Arc::clone(&router),
        };
        let handle = thread::Builder::new()
            .name("compose-up".to_string())
            .spawn(move || bring_up.run(ready_tx))?;

        let containers = match ready_rx.recv() {
            Ok(containers) => containers,
            Err(_) => {
                let err = match handle.join() {
                    Ok(Err(err)) => err,
                    Ok(Ok(())) => HarnessError::Disconnected(
                        "bring-up output ended before the environment became ready".to_string(),
                    ),
                    Err(_) => HarnessError::Process("bring-up reader panicked".to_string()),
                };
                // the reader dropped `compose up`; containers it created may remain
                if let Err(down_err) = self.engine.down() {
                    warn!(error = %down_err, "cleanup after failed bring-up failed");
                }
                return Err(err);
            }
        };
        info!(?containers, "environment ready");
        self.journal.record("ready", &json!({ "containers": &containers }));
        *self.reader_slot()? = Some(handle);
        let _ = self.runtime.set(Runtime { router, containers });

        self.pin_hosts();
        Ok(())
    }

    /// Tears the environment down. Valid exactly once after a successful
    /// [`Supervisor::start`].
    pub fn stop(&self) -> Result<()> {
        let runtime = self.runtime()?;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(HarnessError::Misuse(
                "environment already stopped".to_string(),
            ));
        }

        self.collect_artifacts(runtime);

        self.journal.timed("Bringing down all services", || -> Result<()> {
            let mut stream = self.engine.down_stream()?;
            while let Some(line) = stream.next_line()? {
                let event = self.classifier.classify_teardown(&line);
                trace!(?event, "compose down");
                self.journal.record("down", &event);
            }
            let status = stream.finish()?;
            if status != 0 {
                let args = self.engine.compose_args(&["down", "--remove-orphans"]);
                return Err(failure_error(
                    &args,
                    &CommandOutput {
                        status_code: status,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                    },
                ));
            }
            Ok(())
        })?;

        let handle = self.reader_slot()?.take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(HarnessError::Process(
                        "bring-up reader panicked".to_string(),
                    ))
                }
            }
        }
        runtime.router.close_all();
        info!("environment stopped");
        Ok(())
    }

    fn reader_slot(&self) -> Result<std::sync::MutexGuard<'_, Option<JoinHandle<Result<()>>>>> {
        self.reader
            .lock()
            .map_err(|_| HarnessError::Process("supervisor state lock poisoned".to_string()))
    }

    /// Pins every service's address in `/etc/hosts` of the configured
    /// services so their resolver never waits on DNS.
    fn pin_hosts(&self) {
        let Ok(services) = self.services() else {
            return;
        };
        let quoted: Vec<String> = services.iter().map(|s| format!("'{s}'")).collect();
        let script = format!(
            "for service in {}; do\n    getent hosts \"$service\" >>/etc/hosts\ndone\n",
            quoted.join(" ")
        );
        for target in &self.pin_hosts_in {
            if !services.contains(target) {
                continue;
            }
            match self
                .engine
                .exec(target, &["/bin/sh"], &BTreeMap::new(), Some(&script))
            {
                Ok(output) if output.success() => debug!(service = %target, "pinned service hosts"),
                Ok(output) => warn!(
                    service = %target,
                    status = output.status_code,
                    "pinning service hosts failed"
                ),
                Err(err) => warn!(service = %target, error = %err, "pinning service hosts failed"),
            }
        }
    }

    fn collect_artifacts(&self, runtime: &Runtime) {
        let Some(service) = &self.artifacts.service else {
            return;
        };
        let Some(container) = runtime.containers.get(service) else {
            warn!(service = %service, "artifact service is not part of the environment");
            return;
        };
        let dest = PathBuf::from(&self.artifacts.host_dir);
        if let Err(err) = std::fs::create_dir_all(&dest) {
            warn!(error = %err, dest = %dest.display(), "cannot create artifact directory");
            return;
        }
        match self
            .engine
            .copy_from_container(container, &self.artifacts.container_path, &dest)
        {
            Ok(()) => info!(service = %service, dest = %dest.display(), "collected artifacts"),
            Err(err) => warn!(service = %service, error = %err, "no artifacts collected"),
        }
    }
}

/// State owned by the background thread reading `docker compose up`.
struct BringUp {
    engine: Engine,
    classifier: OutputClassifier,
    readiness: ReadinessSettings,
    journal: Arc<Journal>,
    router: Arc<LogRouter>,
}

struct BringUpState {
    containers: BTreeMap<String, String>,
    pending: BTreeSet<String>,
    ready: Option<mpsc::Sender<BTreeMap<String, String>>>,
}

impl BringUp {
    fn run(self, ready: mpsc::Sender<BTreeMap<String, String>>) -> Result<()> {
        let result = self.pump(ready);
        self.router.close_all();
        if let Err(err) = &result {
            error!(error = %err, "bring-up reader failed");
            self.journal
                .record("reader_failed", &json!({ "error": err.to_string() }));
        }
        result
    }

    fn pump(&self, ready: mpsc::Sender<BTreeMap<String, String>>) -> Result<()> {
        let started = Instant::now();
        let mut state = BringUpState {
            containers: BTreeMap::new(),
            pending: BTreeSet::new(),
            ready: Some(ready),
        };
        let mut stream = self.engine.up_stream()?;
        while let Some(line) = stream.next_line()? {
            let event = self.classifier.classify(&line);
            self.journal.record("up", &event);
            self.handle(event, &mut state, started)?;
        }
        let status = stream.finish()?;
        if status != 0 {
            return Err(HarnessError::Process(format!(
                "`docker compose up` exited with status {status}"
            )));
        }
        if state.ready.is_some() {
            return Err(HarnessError::Disconnected(
                "`docker compose up` ended before attaching to container logs".to_string(),
            ));
        }
        Ok(())
    }

    fn handle(&self, event: LogEvent, state: &mut BringUpState, started: Instant) -> Result<()> {
        match event {
            LogEvent::ServiceLog { service, payload } => self.router.route(&service, payload),
            LogEvent::BeginCreate { container } => {
                let service = self.declared_service(&container)?;
                debug!(container = %container, service = %service, "creating container");
                state.pending.insert(service);
                Ok(())
            }
            LogEvent::FinishCreate { container } => {
                let service = self.declared_service(&container)?;
                self.record_container(&service, state)
            }
            LogEvent::AttachToLogs { containers } => {
                if state.ready.is_none() {
                    return Ok(());
                }
                let seconds = started.elapsed().as_secs_f64();
                info!(seconds, count = containers.len(), "all service containers created");
                let unfinished: Vec<String> = state.pending.iter().cloned().collect();
                for service in unfinished {
                    self.record_container(&service, state)?;
                }
                self.await_running(state.containers.len())?;
                if let Some(ready) = state.ready.take() {
                    let _ = ready.send(state.containers.clone());
                }
                Ok(())
            }
            LogEvent::ImageBuilt { image } => {
                debug!(image = %image, "image built");
                Ok(())
            }
            LogEvent::Other { payload } => {
                trace!(payload = %payload, "unclassified compose output");
                Ok(())
            }
        }
    }

    fn declared_service(&self, container: &str) -> Result<String> {
        let name = self.classifier.container_service_name(container)?;
        self.router.resolve(&name).cloned().ok_or_else(|| {
            HarnessError::Protocol(format!(
                "container {container:?} maps to undeclared service {name:?}"
            ))
        })
    }

    /// Compose announces a container before it can answer which container
    /// belongs to the service, so the lookup is retried.
    fn record_container(&self, service: &str, state: &mut BringUpState) -> Result<()> {
        state.pending.remove(service);
        if state.containers.contains_key(service) {
            return Ok(());
        }
        let id = self.engine.container_id_with_retries(
            service,
            self.readiness.lookup_attempts,
            self.readiness.lookup_pause(),
        )?;
        debug!(service = %service, container = %id, "container recorded");
        state.containers.insert(service.to_string(), id);
        Ok(())
    }

    /// Containers exist before their processes accept connections; wait
    /// until compose reports all of them running.
    fn await_running(&self, expected: usize) -> Result<()> {
        let policy = WaitPolicy::new(self.readiness.timeout(), self.readiness.poll_interval());
        self.journal.timed("Waiting for services to be ready", || {
            wait_until("services to report running", policy, || {
                let running = self.engine.ready_services()?;
                if running.len() == expected {
                    Ok(Probe::Ready(()))
                } else {
                    Ok(Probe::Pending(format!(
                        "{} of {expected} running: {running:?}",
                        running.len()
                    )))
                }
            })
        })
    }
}

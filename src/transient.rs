use crate::config::{HttpSettings, TransientSettings};
use crate::docker::ChildProcess;
use crate::engine::Engine;
use crate::error::{HarnessError, Result};
use crate::http::{service_url, HttpProbe, HttpRequest};
use crate::wait::{retry, wait_until, Probe, WaitPolicy};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What to run: the configuration text, extra environment for the new
/// process and, optionally, the port whose health endpoint gates readiness.
#[derive(Debug, Clone, Default)]
pub struct TransientSpec {
    pub config_text: String,
    pub extra_env: BTreeMap<String, String>,
    pub healthcheck_port: Option<u16>,
}

impl TransientSpec {
    pub fn new(config_text: impl Into<String>) -> Self {
        Self {
            config_text: config_text.into(),
            ..Self::default()
        }
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(name.into(), value.into());
        self
    }

    pub fn healthcheck_port(mut self, port: u16) -> Self {
        self.healthcheck_port = Some(port);
        self
    }
}

pub struct TransientLauncher {
    engine: Engine,
    settings: TransientSettings,
    http: HttpSettings,
    probe: Arc<dyn HttpProbe>,
    output: Option<PathBuf>,
}

impl TransientLauncher {
    pub fn new(engine: Engine, settings: TransientSettings, http: HttpSettings, probe: Arc<dyn HttpProbe>) -> Self {
        Self {
            engine,
            settings,
            http,
            probe,
            output: None,
        }
    }

    /// Appends the launched processes' output to `path`.
    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    pub fn launch(&self, spec: &TransientSpec) -> Result<TransientProcess> {
        let service = self.settings.service.as_str();
        let created = self.engine.exec_checked(service, &["mktemp", "-d"], None)?;
        let dir = created.stdout_text().trim().to_string();
        if dir.is_empty() {
            return Err(HarnessError::Protocol(format!(
                "`mktemp -d` in {service} printed no directory"
            )));
        }
        // from here on, dropping `process` removes the directory
        let mut process = TransientProcess {
            engine: self.engine.clone(),
            service: service.to_string(),
            config_path: format!("{dir}/{}", self.settings.config_file_name),
            pid_path: format!("{dir}/{}", self.settings.pid_file_name),
            dir,
            pid_wait: self.settings.pid_file_wait(),
            child: None,
            closed: false,
        };

        let write = format!("cat >'{}'", process.config_path);
        self.engine
            .exec_checked(service, &["/bin/sh", "-c", write.as_str()], Some(&spec.config_text))?;

        let argv: Vec<String> = self
            .settings
            .command
            .iter()
            .map(|arg| process.substitute(arg))
            .collect();
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let child = self
            .engine
            .spawn_exec(service, &argv, &spec.extra_env, self.output.as_deref())?;
        process.child = Some(child);
        info!(service, dir = %process.dir, "transient process started");

        if let Some(port) = spec.healthcheck_port {
            self.await_healthy(port)?;
        }
        Ok(process)
    }

    fn await_healthy(&self, port: u16) -> Result<()> {
        let url = service_url(
            &self.engine,
            &self.http,
            &self.settings.service,
            port,
            &self.settings.healthcheck_path,
        )?;
        let started = Instant::now();
        let what = format!("transient process on port {port} to become healthy");
        retry(&what, self.settings.healthcheck_attempts, self.settings.healthcheck_pause(), |_| {
            let response = self.probe.send(&HttpRequest::get(url.as_str()))?;
            if response.status == 200 {
                Ok(())
            } else {
                Err(HarnessError::Process(format!("health check answered {}", response.status)))
            }
        })
        .map_err(|err| HarnessError::Timeout {
            what: what.clone(),
            elapsed: started.elapsed(),
            last_state: err.to_string(),
        })?;
        info!(port, seconds = started.elapsed().as_secs_f64(), "transient process healthy");
        Ok(())
    }
}

/// A process started next to the service's own one. Cleanup signals the
/// process through its pid file, waits for it, then removes the temporary
/// directory; it runs on [`TransientProcess::close`] or on drop.
pub struct TransientProcess {
    engine: Engine,
    service: String,
    dir: String,
    config_path: String,
    pid_path: String,
    pid_wait: WaitPolicy,
    child: Option<Box<dyn ChildProcess>>,
    closed: bool,
}

impl TransientProcess {
    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn config_path(&self) -> &str {
        &self.config_path
    }

    pub fn pid_path(&self) -> &str {
        &self.pid_path
    }

    fn substitute(&self, arg: &str) -> String {
        arg.replace("{config}", &self.config_path)
            .replace("{pid}", &self.pid_path)
            .replace("{dir}", &self.dir)
    }

    pub fn close(mut self) -> Result<()> {
        self.cleanup()
    }

    /// A scope that ends right after launch can get here before the process
    /// has written its pid; the signal needs it.
    fn await_pid_file(&self) -> Result<()> {
        let check = format!("test -s '{}'", self.pid_path);
        wait_until(&format!("pid file {}", self.pid_path), self.pid_wait, || {
            let output = self.engine.exec(
                &self.service,
                &["/bin/sh", "-c", check.as_str()],
                &BTreeMap::new(),
                None,
            )?;
            if output.success() {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::Pending("pid file missing or empty".to_string()))
            }
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        self.closed = true;
        let mut first_error: Option<HarnessError> = None;

        if let Some(mut child) = self.child.take() {
            // SIGKILL would orphan the workers; QUIT lets them finish
            let signal = format!("<'{}' xargs kill -QUIT", self.pid_path);
            let signalled = self.await_pid_file().and_then(|()| {
                self.engine
                    .exec_checked(&self.service, &["/bin/sh", "-c", signal.as_str()], None)
            });
            if let Err(err) = signalled {
                warn!(service = %self.service, error = %err, "graceful stop failed; killing exec client");
                first_error = Some(err);
                if let Err(err) = child.kill() {
                    warn!(error = %err, "failed to kill exec client");
                }
            }
            match child.wait() {
                Ok(status) => debug!(status, "transient process exited"),
                Err(err) => {
                    first_error.get_or_insert(err.into());
                }
            }
        }

        if let Err(err) = self
            .engine
            .exec_checked(&self.service, &["rm", "-r", self.dir.as_str()], None)
        {
            warn!(dir = %self.dir, error = %err, "failed to remove temporary directory");
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for TransientProcess {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.cleanup() {
            warn!(error = %err, "transient process cleanup failed");
        }
    }
}

/// Runs `body` with a freshly launched process and cleans up afterwards,
/// whether or not `body` succeeded. An error from `body` takes precedence
/// over a cleanup error.
pub fn with_transient<T>(
    launcher: &TransientLauncher,
    spec: &TransientSpec,
    body: impl FnOnce(&TransientProcess) -> Result<T>,
) -> Result<T> {
    let process = launcher.launch(spec)?;
    let outcome = body(&process);
    let closed = process.close();
    let value = outcome?;
    closed?;
    Ok(value)
}

use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::http::{probe_from_settings, service_url, HttpProbe, HttpRequest, HttpResponse};
use crate::journal::Journal;
use crate::session::Lifecycle;
use crate::supervisor::Supervisor;
use crate::sync::{wait_for_log_message, SyncBarrier};
use crate::transient::{with_transient, TransientLauncher, TransientProcess, TransientSpec};
use crate::workers::{WorkerPidSet, WorkerTracker};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Everything a test holds on to: the running environment plus the barrier,
/// worker tracker and transient launcher that act on it.
pub struct Orchestration {
    cfg: Config,
    supervisor: Supervisor,
    barrier: SyncBarrier,
    workers: WorkerTracker,
    launcher: TransientLauncher,
    probe: Arc<dyn HttpProbe>,
}

impl Orchestration {
    pub fn from_config(cfg: Config) -> Result<Self> {
        let engine = Engine::from_config(&cfg)?;
        let logs = PathBuf::from(&cfg.logs.dir);
        let journal = if cfg.logs.journal {
            let path = logs.join(format!("{}.log", engine.project()));
            info!(journal = %path.display(), "recording environment journal");
            Journal::open(&path)?
        } else {
            Journal::disabled()
        };
        let probe: Arc<dyn HttpProbe> = Arc::from(probe_from_settings(&engine, &cfg.http)?);
        let output = cfg
            .logs
            .journal
            .then(|| logs.join(format!("{}-transient.log", engine.project())));
        let mut orchestration = Self::with_engine(engine, cfg, Arc::new(journal), probe);
        if let Some(path) = output {
            orchestration.launcher = orchestration.launcher.with_output(path);
        }
        Ok(orchestration)
    }

    pub fn with_engine(engine: Engine, cfg: Config, journal: Arc<Journal>, probe: Arc<dyn HttpProbe>) -> Self {
        let supervisor = Supervisor::new(engine.clone(), &cfg, journal);
        let barrier = SyncBarrier::new(engine.clone(), cfg.http.clone(), cfg.sync.clone(), Arc::clone(&probe));
        let workers = WorkerTracker::new(engine.clone(), &cfg.workers);
        let launcher = TransientLauncher::new(engine, cfg.transient.clone(), cfg.http.clone(), Arc::clone(&probe));
        Self {
            cfg,
            supervisor,
            barrier,
            workers,
            launcher,
            probe,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn workers(&self) -> &WorkerTracker {
        &self.workers
    }

    pub fn launcher(&self) -> &TransientLauncher {
        &self.launcher
    }

    pub fn services(&self) -> Result<&[String]> {
        self.supervisor.services()
    }

    pub fn containers(&self) -> Result<&BTreeMap<String, String>> {
        self.supervisor.containers()
    }

    /// Log lines `service` produced since the previous barrier.
    pub fn sync(&self, service: &str) -> Result<Vec<String>> {
        let runtime = self.supervisor.runtime()?;
        self.barrier.sync(runtime.router(), service)
    }

    pub fn sync_access_log(&self, service: &str) -> Result<Vec<String>> {
        let runtime = self.supervisor.runtime()?;
        self.barrier.sync_access_log(runtime.router(), service)
    }

    pub fn wait_for_log_message(&self, service: &str, pattern: &str, timeout: Duration) -> Result<String> {
        let queue = self.supervisor.queue(service)?;
        wait_for_log_message(&queue, service, pattern, timeout)
    }

    pub fn url(&self, service: &str, port: u16, path: &str) -> Result<String> {
        service_url(self.supervisor.engine(), &self.cfg.http, service, port, path)
    }

    pub fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "sending request");
        self.probe.send(request)
    }

    pub fn send_request(
        &self,
        service: &str,
        port: u16,
        path: &str,
        method: &str,
        headers: &[(String, String)],
        body: Option<&str>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::get(self.url(service, port, path)?).method(method);
        request.headers = headers.to_vec();
        request.body = body.map(str::to_string);
        self.send(&request)
    }

    /// Reloads `service` and waits until its workers have been replaced.
    pub fn reload(&self, service: &str) -> Result<WorkerPidSet> {
        let container = self.supervisor.container(service)?;
        self.supervisor
            .journal()
            .timed(&format!("Reloading {service}"), || self.workers.reload(service, container))
    }

    /// Checks `config_text` with the configured check command in a scratch
    /// directory of the service. Returns the exit status and the output lines.
    pub fn test_config(&self, config_text: &str, file_name: &str) -> Result<(i32, Vec<String>)> {
        let settings = &self.cfg.service_config;
        let check: Vec<String> = settings
            .check_command
            .iter()
            .map(|arg| {
                arg.split("{config}")
                    .map(|piece| if piece.is_empty() { String::new() } else { shell_quote(piece) })
                    .collect::<Vec<_>>()
                    .join("\"$file\"")
            })
            .collect();
        let script = format!(
            "dir=$(mktemp -d)\nfile=\"$dir/{file_name}\"\ncat >\"$file\" <<'END_CONFIG'\n{preamble}\n{config_text}\nEND_CONFIG\n{check} 2>&1\nrcode=$?\nrm -r \"$dir\"\nexit \"$rcode\"\n",
            preamble = settings.preamble,
            check = check.join(" "),
        );
        let output = self
            .supervisor
            .engine()
            .exec(&settings.service, &["/bin/sh"], &BTreeMap::new(), Some(&script))?;
        Ok((output.status_code, output.combined_lines()))
    }

    /// Installs `config_text` as the live configuration if it passes
    /// [`Orchestration::test_config`], then reloads. The check result is
    /// returned either way.
    pub fn replace_config(&self, config_text: &str, file_name: &str) -> Result<(i32, Vec<String>)> {
        let (status, lines) = self.test_config(config_text, file_name)?;
        if status != 0 {
            return Ok((status, lines));
        }
        let settings = &self.cfg.service_config;
        let script = format!(
            ">{path} cat <<'END_CONF'\n{preamble}\n{config_text}\nEND_CONF\n",
            path = shell_quote(&settings.live_path),
            preamble = settings.preamble,
        );
        self.supervisor
            .engine()
            .exec_checked(&settings.service, &["/bin/sh"], Some(&script))?;
        self.reload(&settings.service)?;
        Ok((status, lines))
    }

    pub fn replace_file(&self, path: &str, content: &str) -> Result<()> {
        let script = format!(">{} cat <<'END_CONF'\n{content}\nEND_CONF\n", shell_quote(path));
        self.supervisor
            .engine()
            .exec_checked(&self.cfg.service_config.service, &["/bin/sh"], Some(&script))?;
        Ok(())
    }

    pub fn custom_process(&self, spec: &TransientSpec) -> Result<TransientProcess> {
        self.launcher.launch(spec)
    }

    pub fn with_custom_process<T>(
        &self,
        spec: &TransientSpec,
        body: impl FnOnce(&TransientProcess) -> Result<T>,
    ) -> Result<T> {
        with_transient(&self.launcher, spec, body)
    }
}

impl Lifecycle for Orchestration {
    fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    fn stop(&self) -> Result<()> {
        self.supervisor.stop()
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'\''"#))
}

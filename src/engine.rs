use crate::config::{self, Config, DockerSettings};
use crate::docker::{
    execute, spawn_error, ChildProcess, CommandOutput, DockerRunner, LineStream, RealDockerRunner,
};
use crate::error::{HarnessError, Result};
use crate::wait::retry;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Typed queries against `docker` / `docker compose`, all funnelled through a
/// [`DockerRunner`].
#[derive(Clone)]
pub struct Engine {
    runner: Arc<dyn DockerRunner>,
    project: String,
    docker_flags: Vec<String>,
    compose_prefix: Vec<String>,
}

impl Engine {
    pub fn new(runner: Arc<dyn DockerRunner>, settings: &DockerSettings, project: &str) -> Self {
        let mut compose_prefix = vec!["compose".to_string()];
        compose_prefix.extend(settings.compose_flags.iter().cloned());
        for file in &settings.compose_files {
            compose_prefix.push("-f".to_string());
            compose_prefix.push(file.clone());
        }
        Self {
            runner,
            project: project.to_string(),
            docker_flags: settings.docker_flags.clone(),
            compose_prefix,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let docker = config::locate_docker()?;
        let env = config::child_env(&config::current_env(), &docker, &cfg.docker.project_name)?;
        let project = env
            .get("COMPOSE_PROJECT_NAME")
            .cloned()
            .unwrap_or_else(|| cfg.docker.project_name.clone());
        let cwd = if cfg.docker.project_dir.trim().is_empty() {
            env::current_dir()?
        } else {
            PathBuf::from(&cfg.docker.project_dir)
        };
        debug!(docker = %docker.display(), cwd = %cwd.display(), project = %project, "using container engine");
        let runner = RealDockerRunner::new(docker, cwd, env);
        Ok(Self::new(Arc::new(runner), &cfg.docker, &project))
    }

    pub fn runner(&self) -> &dyn DockerRunner {
        self.runner.as_ref()
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn compose_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = self.docker_flags.clone();
        full.extend(self.compose_prefix.iter().cloned());
        full.extend(args.iter().map(|arg| arg.to_string()));
        full
    }

    pub fn docker_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = self.docker_flags.clone();
        full.extend(args.iter().map(|arg| arg.to_string()));
        full
    }

    pub fn compose(&self, args: &[&str], input: Option<&str>) -> Result<CommandOutput> {
        execute(self.runner(), &self.compose_args(args), input)
    }

    pub fn stream_compose(&self, args: &[&str]) -> Result<Box<dyn LineStream>> {
        let full = self.compose_args(args);
        self.runner.stream(&full).map_err(|err| spawn_error(err, &full))
    }

    pub fn up_stream(&self) -> Result<Box<dyn LineStream>> {
        self.stream_compose(&["up", "--remove-orphans", "--force-recreate", "--no-color"])
    }

    pub fn down_stream(&self) -> Result<Box<dyn LineStream>> {
        self.stream_compose(&["down", "--remove-orphans"])
    }

    pub fn down(&self) -> Result<CommandOutput> {
        self.compose(&["down", "--remove-orphans"], None)
    }

    pub fn declared_services(&self) -> Result<Vec<String>> {
        let output = self.compose(&["config", "--services"], None)?;
        Ok(output
            .stdout_text()
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    pub fn ready_services(&self) -> Result<BTreeSet<String>> {
        let output = self.compose(&["ps", "--services", "--filter", "status=running"], None)?;
        Ok(output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Some compose versions exit non-zero when the service has no container
    /// yet, others succeed with empty output. Both count as "not yet".
    pub fn container_id(&self, service: &str) -> Result<String> {
        let output = self.compose(&["ps", "--quiet", service], None)?;
        let id = output.stdout_text().trim().to_string();
        if id.is_empty() {
            return Err(HarnessError::Process(format!(
                "no container id reported for service {service:?}"
            )));
        }
        Ok(id)
    }

    pub fn container_id_with_retries(
        &self,
        service: &str,
        attempts: u32,
        pause: Duration,
    ) -> Result<String> {
        retry(&format!("container id of {service}"), attempts, pause, |_| {
            self.container_id(service)
        })
    }

    /// Host address published for `service:port`, as `host:port`.
    pub fn published_port(&self, service: &str, port: u16) -> Result<String> {
        let port = port.to_string();
        let output = self.compose(&["port", service, port.as_str()], None)?;
        let text = output.stdout_text();
        let address = text.lines().map(str::trim).find(|line| !line.is_empty()).ok_or_else(|| {
            HarnessError::Process(format!("port {port} of service {service:?} is not published"))
        })?;
        Ok(match address.rsplit_once(':') {
            Some(("0.0.0.0", host_port)) | Some(("[::]", host_port)) => format!("127.0.0.1:{host_port}"),
            _ => address.to_string(),
        })
    }

    /// `(pid, command)` for every process in the container. `docker top`
    /// insists on `pid` being the first column.
    pub fn top(&self, container: &str) -> Result<Vec<(u32, String)>> {
        let args = self.docker_args(&["top", container, "-o", "pid,cmd"]);
        let output = execute(self.runner(), &args, None)?;
        parse_top_output(&output.stdout_text())
    }

    pub fn exec_args(&self, service: &str, env: &BTreeMap<String, String>, argv: &[&str]) -> Vec<String> {
        let mut args = vec!["exec", "-T"];
        let pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for pair in &pairs {
            args.push("--env");
            args.push(pair);
        }
        args.push("--");
        args.push(service);
        args.extend_from_slice(argv);
        self.compose_args(&args)
    }

    /// Runs `argv` inside the service's container. A non-zero exit is
    /// returned, not raised.
    pub fn exec(
        &self,
        service: &str,
        argv: &[&str],
        env: &BTreeMap<String, String>,
        input: Option<&str>,
    ) -> Result<CommandOutput> {
        let args = self.exec_args(service, env, argv);
        self.runner
            .run(&args, input)
            .map_err(|err| spawn_error(err, &args))
    }

    pub fn exec_checked(&self, service: &str, argv: &[&str], input: Option<&str>) -> Result<CommandOutput> {
        let args = self.exec_args(service, &BTreeMap::new(), argv);
        execute(self.runner(), &args, input)
    }

    pub fn spawn_exec(
        &self,
        service: &str,
        argv: &[&str],
        env: &BTreeMap<String, String>,
        output: Option<&Path>,
    ) -> Result<Box<dyn ChildProcess>> {
        let args = self.exec_args(service, env, argv);
        self.runner
            .spawn(&args, output)
            .map_err(|err| spawn_error(err, &args))
    }

    pub fn copy_from_container(&self, container: &str, source: &str, dest: &Path) -> Result<()> {
        let from = format!("{container}:{source}");
        let dest = dest.to_string_lossy().to_string();
        let args = self.docker_args(&["cp", from.as_str(), dest.as_str()]);
        execute(self.runner(), &args, None)?;
        Ok(())
    }
}

pub fn parse_top_output(text: &str) -> Result<Vec<(u32, String)>> {
    let mut processes = Vec::new();
    // first line holds the column names
    for line in text.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let Some(pid) = fields.next() else {
            continue;
        };
        let pid: u32 = pid.parse().map_err(|_| {
            HarnessError::Protocol(format!("unexpected `docker top` row: {line:?}"))
        })?;
        let command = fields.collect::<Vec<_>>().join(" ");
        processes.push((pid, command));
    }
    Ok(processes)
}

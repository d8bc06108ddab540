use crate::error::{HarnessError, Result};
use crate::wait::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_ENV: &str = "STAGEHAND_CONFIG";
pub const DEFAULT_PROJECT_NAME: &str = "test";

/// Variables forwarded verbatim to every engine command when present.
const FORWARDED_VARS: [&str; 3] = ["BASE_IMAGE", "NGINX_CONF_PATH", "NGINX_MODULES_PATH"];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub docker: DockerSettings,
    pub sync: SyncSettings,
    pub http: HttpSettings,
    pub readiness: ReadinessSettings,
    pub workers: WorkerSettings,
    pub transient: TransientSettings,
    pub service_config: ServiceConfigSettings,
    pub artifacts: ArtifactSettings,
    pub logs: LogSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSettings {
    pub project_name: String,
    pub project_dir: String,
    pub compose_files: Vec<String>,
    pub docker_flags: Vec<String>,
    pub compose_flags: Vec<String>,
    pub pin_hosts_in: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    pub port: u16,
    pub header: String,
    pub access_log_path: String,
    pub access_log_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Exec,
    Direct,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    pub transport: Transport,
    pub client_service: String,
    pub client_command: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSettings {
    pub lookup_attempts: u32,
    pub lookup_pause_ms: u64,
    pub poll_interval_ms: u64,
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub service: String,
    pub pattern: String,
    pub reload_command: Vec<String>,
    pub poll_interval_ms: u64,
    pub drain_timeout_sec: u64,
    pub spawn_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TransientSettings {
    pub service: String,
    pub command: Vec<String>,
    pub config_file_name: String,
    pub pid_file_name: String,
    pub healthcheck_path: String,
    pub healthcheck_attempts: u32,
    pub healthcheck_pause_ms: u64,
    pub pid_file_timeout_ms: u64,
    pub pid_file_poll_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfigSettings {
    pub service: String,
    pub live_path: String,
    pub preamble: String,
    pub check_command: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactSettings {
    pub service: Option<String>,
    pub container_path: String,
    pub host_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    pub dir: String,
    pub journal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            docker: DockerSettings::default(),
            sync: SyncSettings::default(),
            http: HttpSettings::default(),
            readiness: ReadinessSettings::default(),
            workers: WorkerSettings::default(),
            transient: TransientSettings::default(),
            service_config: ServiceConfigSettings::default(),
            artifacts: ArtifactSettings::default(),
            logs: LogSettings::default(),
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            project_dir: "".to_string(),
            compose_files: Vec::new(),
            docker_flags: Vec::new(),
            compose_flags: Vec::new(),
            pin_hosts_in: vec!["nginx".to_string()],
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            port: 8888,
            header: "X-Datadog-Test-Sync-Token".to_string(),
            access_log_path: "/sync".to_string(),
            access_log_port: 80,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Exec,
            client_service: "client".to_string(),
            client_command: "curljson.sh".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            lookup_attempts: 100,
            lookup_pause_ms: 100,
            poll_interval_ms: 100,
            timeout_sec: 120,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            service: "nginx".to_string(),
            pattern: "nginx: worker process".to_string(),
            reload_command: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
            poll_interval_ms: 500,
            drain_timeout_sec: 10,
            spawn_timeout_sec: 10,
        }
    }
}

impl Default for TransientSettings {
    fn default() -> Self {
        Self {
            service: "nginx".to_string(),
            command: vec![
                "nginx".to_string(),
                "-c".to_string(),
                "{config}".to_string(),
                "-g".to_string(),
                "daemon off; pid \"{pid}\"; error_log stderr notice;".to_string(),
            ],
            config_file_name: "nginx.conf".to_string(),
            pid_file_name: "nginx.pid".to_string(),
            healthcheck_path: "/healthcheck".to_string(),
            healthcheck_attempts: 20,
            healthcheck_pause_ms: 250,
            pid_file_timeout_ms: 5000,
            pid_file_poll_ms: 50,
        }
    }
}

impl Default for ServiceConfigSettings {
    fn default() -> Self {
        Self {
            service: "nginx".to_string(),
            live_path: "/datadog-tests/nginx.conf".to_string(),
            preamble: "error_log stderr notice;".to_string(),
            check_command: vec![
                "nginx".to_string(),
                "-t".to_string(),
                "-c".to_string(),
                "{config}".to_string(),
            ],
        }
    }
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            service: None,
            container_path: "/coverage".to_string(),
            host_dir: "artifacts".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            journal: true,
        }
    }
}

impl ReadinessSettings {
    pub fn lookup_pause(&self) -> Duration {
        Duration::from_millis(self.lookup_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_sec)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_sec)
    }
}

impl TransientSettings {
    pub fn healthcheck_pause(&self) -> Duration {
        Duration::from_millis(self.healthcheck_pause_ms)
    }

    pub fn pid_file_wait(&self) -> WaitPolicy {
        WaitPolicy::new(
            Duration::from_millis(self.pid_file_timeout_ms),
            Duration::from_millis(self.pid_file_poll_ms),
        )
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub fn read_config_from_str(text: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(text)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// A missing file is not an error: the defaults describe the stock topology.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        validate_config(&cfg)?;
        return Ok(cfg);
    }
    let text = fs::read_to_string(path)?;
    read_config_from_str(&text)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.version != 1 {
        return Err(HarnessError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.docker.project_name.trim().is_empty() {
        return Err(HarnessError::Config(
            "docker.project_name must not be empty".to_string(),
        ));
    }
    if cfg.workers.pattern.trim().is_empty() {
        return Err(HarnessError::Config(
            "workers.pattern must not be empty".to_string(),
        ));
    }
    if cfg.workers.reload_command.is_empty() {
        return Err(HarnessError::Config(
            "workers.reload_command must not be empty".to_string(),
        ));
    }
    if !cfg.transient.command.iter().any(|arg| arg.contains("{config}")) {
        return Err(HarnessError::Config(
            "transient.command must reference {config}".to_string(),
        ));
    }
    if !cfg.transient.command.iter().any(|arg| arg.contains("{pid}")) {
        return Err(HarnessError::Config(
            "transient.command must reference {pid}".to_string(),
        ));
    }
    if cfg.readiness.lookup_attempts == 0 || cfg.transient.healthcheck_attempts == 0 {
        return Err(HarnessError::Config(
            "attempt counts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("stagehand");
    base.push("config.yaml");
    base
}

pub fn locate_docker() -> Result<PathBuf> {
    which::which("docker").map_err(|err| {
        HarnessError::Config(format!("unable to locate `docker` on PATH: {err}"))
    })
}

/// Engine commands run with a scrubbed environment. `PATH` only holds the
/// directory of the docker executable because compose re-invokes `docker`
/// unqualified.
pub fn child_env(
    parent: &BTreeMap<String, String>,
    docker: &Path,
    default_project: &str,
) -> Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    for name in FORWARDED_VARS {
        if let Some(value) = parent.get(name) {
            result.insert(name.to_string(), value.clone());
        }
    }
    for (name, value) in parent {
        if name.starts_with("DOCKER_") || name.starts_with("COMPOSE_") {
            result.insert(name.clone(), value.clone());
        }
    }
    result
        .entry("COMPOSE_PROJECT_NAME".to_string())
        .or_insert_with(|| default_project.to_string());

    let docker_bin = docker
        .parent()
        .map(|dir| dir.to_string_lossy().to_string())
        .unwrap_or_default();
    result.insert("PATH".to_string(), docker_bin);

    // compose consults ~/.cache and ~/.docker
    let home = parent
        .get("HOME")
        .ok_or_else(|| HarnessError::Config("HOME is not set".to_string()))?;
    result.insert("HOME".to_string(), home.clone());
    Ok(result)
}

pub fn current_env() -> BTreeMap<String, String> {
    env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parent_env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_yaml_matches_default_config() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default yaml");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn config_unknown_field_errors() {
        let yaml = "version: 1\nunknown: true\n";
        let result: std::result::Result<Config, serde_yaml::Error> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1\nsync:\n  port: 9999\n").expect("config");
        assert_eq!(cfg.sync.port, 9999);
        assert_eq!(cfg.sync.header, "X-Datadog-Test-Sync-Token");
        assert_eq!(cfg.readiness.lookup_attempts, 100);
        assert_eq!(cfg.workers.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.http.transport, Transport::Exec);
    }

    #[test]
    fn transport_parses_snake_case() {
        let cfg = read_config_from_str("version: 1\nhttp:\n  transport: direct\n").unwrap();
        assert_eq!(cfg.http.transport, Transport::Direct);
    }

    #[test]
    fn validate_rejects_transient_command_without_pid() {
        let yaml = "version: 1\ntransient:\n  command: [\"nginx\", \"-c\", \"{config}\"]\n";
        let err = read_config_from_str(yaml).expect_err("missing {pid}");
        assert!(err.to_string().contains("{pid}"));
    }

    #[test]
    fn validate_rejects_unknown_version() {
        let err = read_config_from_str("version: 7\n").expect_err("bad version");
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn config_file_is_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "version: 1\ndocker:\n  project_name: itest\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.docker.project_name, "itest");
    }

    #[test]
    fn explicit_config_path_wins() {
        let explicit = PathBuf::from("/tmp/explicit.yaml");
        assert_eq!(resolve_config_path(Some(&explicit)), explicit);
    }

    #[test]
    fn child_env_forwards_docker_and_compose_variables() {
        let parent = parent_env(&[
            ("HOME", "/home/tester"),
            ("DOCKER_HOST", "tcp://10.0.0.1:2376"),
            ("COMPOSE_VERSION", "2"),
            ("BASE_IMAGE", "nginx:1.27.2"),
            ("SECRET_TOKEN", "nope"),
            ("PATH", "/usr/bin:/bin"),
        ]);
        let env = child_env(&parent, Path::new("/usr/local/bin/docker"), "test").unwrap();
        assert_eq!(env["DOCKER_HOST"], "tcp://10.0.0.1:2376");
        assert_eq!(env["COMPOSE_VERSION"], "2");
        assert_eq!(env["BASE_IMAGE"], "nginx:1.27.2");
        assert_eq!(env["COMPOSE_PROJECT_NAME"], "test");
        assert_eq!(env["PATH"], "/usr/local/bin");
        assert_eq!(env["HOME"], "/home/tester");
        assert!(!env.contains_key("SECRET_TOKEN"));
    }

    #[test]
    fn child_env_keeps_explicit_project_name() {
        let parent = parent_env(&[("HOME", "/h"), ("COMPOSE_PROJECT_NAME", "ci")]);
        let env = child_env(&parent, Path::new("/bin/docker"), "test").unwrap();
        assert_eq!(env["COMPOSE_PROJECT_NAME"], "ci");
    }

    #[test]
    fn child_env_requires_home() {
        let err = child_env(&BTreeMap::new(), Path::new("/bin/docker"), "test")
            .expect_err("HOME missing");
        assert!(err.to_string().contains("HOME"));
    }
}

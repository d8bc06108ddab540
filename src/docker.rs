use crate::error::{HarnessError, ProcessErrorDetails, Result};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Both streams, stdout first, split into lines.
    pub fn combined_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.stdout_text().lines().map(str::to_string).collect();
        lines.extend(self.stderr_text().lines().map(str::to_string));
        lines
    }
}

/// Line-at-a-time view of a running command's combined stdout and stderr.
pub trait LineStream: Send {
    fn next_line(&mut self) -> io::Result<Option<String>>;
    fn finish(self: Box<Self>) -> io::Result<i32>;
}

/// A command left running in the background, e.g. an extra server instance.
pub trait ChildProcess: Send {
    fn wait(&mut self) -> io::Result<i32>;
    fn kill(&mut self) -> io::Result<()>;
}

pub trait DockerRunner: Send + Sync {
    fn run(&self, args: &[String], input: Option<&str>) -> io::Result<CommandOutput>;

    fn stream(&self, args: &[String]) -> io::Result<Box<dyn LineStream>>;

    fn spawn(&self, args: &[String], output: Option<&Path>) -> io::Result<Box<dyn ChildProcess>>;
}

pub struct RealDockerRunner {
    docker: PathBuf,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
}

impl RealDockerRunner {
    pub fn new(docker: PathBuf, cwd: PathBuf, env: BTreeMap<String, String>) -> Self {
        Self { docker, cwd, env }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args).current_dir(&self.cwd).env_clear().envs(&self.env);
        cmd
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String], input: Option<&str>) -> io::Result<CommandOutput> {
        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes())?;
            }
        }
        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn stream(&self, args: &[String]) -> io::Result<Box<dyn LineStream>> {
        // one pipe for both streams keeps lines in the order they were written
        let (reader, writer) = io::pipe()?;
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(writer.try_clone()?))
            .stderr(Stdio::from(writer));
        let child = cmd.spawn()?;
        // the command still holds write ends; the reader sees EOF only once they are gone
        drop(cmd);
        let (tx, rx) = mpsc::channel();
        let pump = pump_lines(reader, tx);
        Ok(Box::new(ChildLineStream {
            child,
            rx,
            pump: Some(pump),
        }))
    }

    fn spawn(&self, args: &[String], output: Option<&Path>) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null());
        match output {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdout(Stdio::from(file.try_clone()?));
                cmd.stderr(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        Ok(Box::new(SpawnedChild { child: cmd.spawn()? }))
    }
}

fn pump_lines<R: io::Read + Send + 'static>(
    source: R,
    tx: mpsc::Sender<io::Result<String>>,
) -> thread::JoinHandle<()> {
    // service logs are not guaranteed to be UTF-8
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(Ok(line)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    break;
                }
            }
        }
    })
}

struct ChildLineStream {
    child: Child,
    rx: mpsc::Receiver<io::Result<String>>,
    pump: Option<thread::JoinHandle<()>>,
}

impl LineStream for ChildLineStream {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        match self.rx.recv() {
            Ok(line) => line.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn finish(mut self: Box<Self>) -> io::Result<i32> {
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        Ok(exit_code(self.child.wait()?))
    }
}

impl Drop for ChildLineStream {
    /// A stream abandoned before its command exits takes the command down
    /// with it.
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct SpawnedChild {
    child: Child,
}

impl ChildProcess for SpawnedChild {
    fn wait(&mut self) -> io::Result<i32> {
        Ok(exit_code(self.child.wait()?))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

pub fn render_docker_command(args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push("docker".to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

pub fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    let (error_code, hint) = if err.kind() == io::ErrorKind::NotFound {
        (
            "docker_not_found",
            Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
        )
    } else {
        ("process_command_failed", None)
    };
    ProcessErrorDetails {
        error_code: error_code.to_string(),
        hint,
        command: Some(command.to_string()),
        raw_stdout: None,
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown command: docker compose") || lower.contains("is not a docker command")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some(
                "Docker Compose is unavailable. If HOME is overridden, set DOCKER_CONFIG to a directory containing Docker CLI plugins."
                    .to_string(),
            ),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start dockerd and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some(
                "A required host port is already in use. Stop the conflicting project first."
                    .to_string(),
            ),
        );
    }

    if lower.contains("no such service") || lower.contains("is not running") {
        return ("docker_service_unavailable".to_string(), None);
    }

    ("process_command_failed".to_string(), None)
}

pub fn spawn_error(err: io::Error, args: &[String]) -> HarnessError {
    let command = render_docker_command(args);
    let details = docker_spawn_error_details(&err, &command);
    HarnessError::ProcessDetailed {
        message: format!("failed to run command `{command}`: {err}"),
        details,
    }
}

pub fn failure_error(args: &[String], output: &CommandOutput) -> HarnessError {
    let command = render_docker_command(args);
    let stdout = output.stdout_text().trim().to_string();
    let stderr = output.stderr_text().trim().to_string();
    let (error_code, hint) = classify_docker_command_failure(&stderr);
    let mut message = format!(
        "command failed with status {} while running `{}`",
        output.status_code, command
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    HarnessError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command),
            raw_stdout: (!stdout.is_empty()).then_some(stdout),
            raw_stderr: (!stderr.is_empty()).then_some(stderr),
        },
    }
}

/// Runs a command and turns a non-zero exit into an error carrying both
/// captured streams.
pub fn execute(
    runner: &dyn DockerRunner,
    args: &[String],
    input: Option<&str>,
) -> Result<CommandOutput> {
    let output = runner.run(args, input).map_err(|err| spawn_error(err, args))?;
    if !output.success() {
        return Err(failure_error(args, &output));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok_output, status_output, FakeRunner};
    #[cfg(unix)]
    use crate::testing::{process_alive, ScriptDocker};

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn render_quotes_whitespace_and_empty_args() {
        let rendered = render_docker_command(&args(&["compose", "exec", "", "sh -c"]));
        assert_eq!(rendered, "docker compose exec \"\" \"sh -c\"");
    }

    #[test]
    fn classify_daemon_unreachable() {
        let (code, hint) = classify_docker_command_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert_eq!(code, "docker_daemon_unreachable");
        assert!(hint.is_some());
    }

    #[test]
    fn classify_unknown_failure_is_generic() {
        let (code, hint) = classify_docker_command_failure("something odd");
        assert_eq!(code, "process_command_failed");
        assert!(hint.is_none());
    }

    #[test]
    fn execute_surfaces_captured_streams_on_failure() {
        let runner = FakeRunner::new(|_, _| CommandOutput {
            status_code: 17,
            stdout: b"partial output\n".to_vec(),
            stderr: b"port is already allocated\n".to_vec(),
        });
        let err = execute(&runner, &args(&["compose", "up"]), None).expect_err("failure");
        let details = err.details().expect("details").clone();
        assert_eq!(details.error_code, "docker_port_conflict");
        assert_eq!(details.raw_stdout.as_deref(), Some("partial output"));
        assert_eq!(details.raw_stderr.as_deref(), Some("port is already allocated"));
        assert!(err.to_string().contains("status 17"));
    }

    #[test]
    fn execute_passes_stdin_through() {
        let runner = FakeRunner::new(|_, input| ok_output(input.unwrap_or_default()));
        let output = execute(&runner, &args(&["compose", "exec"]), Some("hello")).unwrap();
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(runner.calls()[0].input.as_deref(), Some("hello"));
    }

    #[cfg(unix)]
    fn drain(stream: &mut Box<dyn LineStream>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().unwrap() {
            lines.push(line);
        }
        lines
    }

    #[cfg(unix)]
    #[test]
    fn stream_interleaves_stdout_and_stderr_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let docker = ScriptDocker::new(
            dir.path(),
            "i=0\nwhile [ $i -lt 200 ]; do\n  echo \"err $i\" >&2\n  echo \"out $i\"\n  i=$((i+1))\ndone",
        );
        let mut stream = docker.stream(&args(&["compose", "up"])).unwrap();
        let lines = drain(&mut stream);
        let expected: Vec<String> = (0..200)
            .flat_map(|i| [format!("err {i}"), format!("out {i}")])
            .collect();
        assert_eq!(lines, expected);
        assert_eq!(stream.finish().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn compose_created_lines_on_stderr_precede_attach_on_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let docker = ScriptDocker::new(
            dir.path(),
            "echo ' Container test-a-1  Created' >&2\n\
             echo ' Container test-b-1  Created' >&2\n\
             echo 'Attaching to test-a-1, test-b-1'",
        );
        let mut stream = docker.stream(&args(&["compose", "up"])).unwrap();
        let lines = drain(&mut stream);
        assert_eq!(lines.last().map(String::as_str), Some("Attaching to test-a-1, test-b-1"));
        assert_eq!(lines.len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn stream_finish_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let docker = ScriptDocker::new(dir.path(), "echo \"args: $*\"\nexit 3");
        let mut stream = docker.stream(&args(&["compose", "down"])).unwrap();
        assert_eq!(drain(&mut stream), vec!["args: compose down"]);
        assert_eq!(stream.finish().unwrap(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn dropped_stream_kills_its_command() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let docker = ScriptDocker::new(
            dir.path(),
            &format!("echo $$ >'{}'\necho started\nexec sleep 30", pid_file.display()),
        );
        let mut stream = docker.stream(&args(&["compose", "up"])).unwrap();
        assert_eq!(stream.next_line().unwrap().as_deref(), Some("started"));
        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();

        let started = std::time::Instant::now();
        drop(stream);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(!process_alive(&pid), "command {pid} outlived its stream");
    }

    #[cfg(unix)]
    #[test]
    fn run_captures_streams_and_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let docker = ScriptDocker::new(dir.path(), "cat\necho oops >&2\nexit 2");
        let output = docker.run(&args(&["compose", "exec"]), Some("piped in")).unwrap();
        assert_eq!(output.status_code, 2);
        assert_eq!(output.stdout_text(), "piped in");
        assert_eq!(output.stderr_text(), "oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn spawned_child_writes_to_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("child.log");
        let docker = ScriptDocker::new(dir.path(), "echo to-out\necho to-err >&2\nexit 4");
        let mut child = docker.spawn(&args(&["compose", "exec"]), Some(&log)).unwrap();
        assert_eq!(child.wait().unwrap(), 4);
        let written = std::fs::read_to_string(&log).unwrap();
        assert!(written.contains("to-out"));
        assert!(written.contains("to-err"));
    }

    #[test]
    fn combined_lines_keeps_stdout_before_stderr() {
        let mut output = status_output(1, "a\nb\n");
        output.stderr = b"c\n".to_vec();
        assert_eq!(output.combined_lines(), vec!["a", "b", "c"]);
    }
}

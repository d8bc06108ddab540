//! Scripted stand-in for the container engine used by unit tests.

use crate::docker::{ChildProcess, CommandOutput, DockerRunner, LineStream, RealDockerRunner};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Run,
    Stream,
    Spawn,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub args: Vec<String>,
    pub input: Option<String>,
}

impl RecordedCall {
    pub fn has(&self, needle: &[&str]) -> bool {
        args_contain(&self.args, needle)
    }
}

type Handler = Box<dyn Fn(&[String], Option<&str>) -> CommandOutput + Send + Sync>;

pub struct FakeRunner {
    handler: Handler,
    calls: Mutex<Vec<RecordedCall>>,
    streams: Mutex<VecDeque<Box<dyn LineStream>>>,
    children: Mutex<Vec<Arc<Mutex<ChildState>>>>,
}

#[derive(Debug, Default)]
pub struct ChildState {
    pub waited: bool,
    pub killed: bool,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[String], Option<&str>) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_, _| ok_output(""))
    }

    pub fn push_stream(&self, lines: &[&str], status: i32) {
        let (tx, rx) = mpsc::channel();
        for line in lines {
            tx.send(line.to_string()).unwrap();
        }
        drop(tx);
        self.streams
            .lock()
            .unwrap()
            .push_back(Box::new(FakeStream { rx, status }));
    }

    /// Lines sent on the returned channel reach the stream reader as they
    /// arrive; dropping the sender ends the stream with status 0.
    pub fn push_live_stream(&self) -> mpsc::Sender<String> {
        let (tx, rx) = mpsc::channel();
        self.streams
            .lock()
            .unwrap()
            .push_back(Box::new(FakeStream { rx, status: 0 }));
        tx
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &[&str]) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.has(needle))
            .collect()
    }

    pub fn position(&self, needle: &[&str]) -> Option<usize> {
        self.calls().iter().position(|call| call.has(needle))
    }

    pub fn children(&self) -> Vec<Arc<Mutex<ChildState>>> {
        self.children.lock().unwrap().clone()
    }

    fn record(&self, kind: CallKind, args: &[String], input: Option<&str>) {
        self.calls.lock().unwrap().push(RecordedCall {
            kind,
            args: args.to_vec(),
            input: input.map(str::to_string),
        });
    }
}

impl DockerRunner for FakeRunner {
    fn run(&self, args: &[String], input: Option<&str>) -> io::Result<CommandOutput> {
        self.record(CallKind::Run, args, input);
        Ok((self.handler)(args, input))
    }

    fn stream(&self, args: &[String]) -> io::Result<Box<dyn LineStream>> {
        self.record(CallKind::Stream, args, None);
        let next = self.streams.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| {
            let (_tx, rx) = mpsc::channel();
            Box::new(FakeStream { rx, status: 0 })
        }))
    }

    fn spawn(&self, args: &[String], _output: Option<&Path>) -> io::Result<Box<dyn ChildProcess>> {
        self.record(CallKind::Spawn, args, None);
        let state = Arc::new(Mutex::new(ChildState::default()));
        self.children.lock().unwrap().push(Arc::clone(&state));
        Ok(Box::new(FakeChild { state }))
    }
}

struct FakeStream {
    rx: mpsc::Receiver<String>,
    status: i32,
}

impl LineStream for FakeStream {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.rx.recv().ok())
    }

    fn finish(self: Box<Self>) -> io::Result<i32> {
        Ok(self.status)
    }
}

struct FakeChild {
    state: Arc<Mutex<ChildState>>,
}

impl ChildProcess for FakeChild {
    fn wait(&mut self) -> io::Result<i32> {
        self.state.lock().unwrap().waited = true;
        Ok(0)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().killed = true;
        Ok(())
    }
}

pub fn ok_output(stdout: &str) -> CommandOutput {
    status_output(0, stdout)
}

pub fn status_output(status_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        status_code,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Three-line answer shaped like `curljson.sh` output.
pub fn curl_output(status: u16, body: &str) -> CommandOutput {
    ok_output(&format!(
        "{{\"response_code\":{status}}}\n{{}}\n{}\n",
        serde_json::to_string(body).unwrap()
    ))
}

pub fn args_contain(args: &[String], needle: &[&str]) -> bool {
    if needle.is_empty() {
        return true;
    }
    args.windows(needle.len())
        .any(|window| window.iter().zip(needle).all(|(a, b)| a == b))
}

pub fn header_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("{name}: ");
    args.iter().find_map(|arg| arg.strip_prefix(prefix.as_str()))
}

/// Real process runner with a shell script standing in for `docker`. The
/// script runs in `dir` and sees the docker arguments as `$@`.
#[cfg(unix)]
pub struct ScriptDocker {
    runner: RealDockerRunner,
    script: String,
}

#[cfg(unix)]
impl ScriptDocker {
    pub fn new(dir: &Path, body: &str) -> Self {
        let script = dir.join("docker.sh");
        std::fs::write(&script, format!("{body}\n")).unwrap();
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        Self {
            runner: RealDockerRunner::new(PathBuf::from("/bin/sh"), dir.to_path_buf(), env),
            script: script.to_string_lossy().to_string(),
        }
    }

    fn argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = vec![self.script.clone()];
        argv.extend(args.iter().cloned());
        argv
    }
}

#[cfg(unix)]
impl DockerRunner for ScriptDocker {
    fn run(&self, args: &[String], input: Option<&str>) -> io::Result<CommandOutput> {
        self.runner.run(&self.argv(args), input)
    }

    fn stream(&self, args: &[String]) -> io::Result<Box<dyn LineStream>> {
        self.runner.stream(&self.argv(args))
    }

    fn spawn(&self, args: &[String], output: Option<&Path>) -> io::Result<Box<dyn ChildProcess>> {
        self.runner.spawn(&self.argv(args), output)
    }
}

/// Whether a process with this id still exists.
#[cfg(unix)]
pub fn process_alive(pid: &str) -> bool {
    std::process::Command::new("/bin/sh")
        .args(["-c", &format!("kill -0 {pid}")])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

use crate::config::{HttpSettings, SyncSettings};
use crate::engine::Engine;
use crate::error::{HarnessError, Result};
use crate::http::{service_url, HttpProbe, HttpRequest};
use crate::router::{LogQueue, LogRouter};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncToken(String);

impl SyncToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The line the service logs once it has handled the sync request.
    pub fn sentinel(&self) -> String {
        format!("SYNC {}", self.0)
    }
}

impl Default for SyncToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SyncToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read barrier on a service's log: everything the service logged before it
/// handled the tokened request is returned, nothing after.
pub struct SyncBarrier {
    engine: Engine,
    http: HttpSettings,
    settings: SyncSettings,
    probe: Arc<dyn HttpProbe>,
    /// Every token this barrier has used, kept for the barrier's whole life
    /// so that reuse is always detected. A run issues one per sync, so this
    /// stays small.
    consumed: Mutex<BTreeSet<SyncToken>>,
}

impl SyncBarrier {
    pub fn new(engine: Engine, http: HttpSettings, settings: SyncSettings, probe: Arc<dyn HttpProbe>) -> Self {
        Self {
            engine,
            http,
            settings,
            probe,
            consumed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn sync(&self, router: &LogRouter, service: &str) -> Result<Vec<String>> {
        self.sync_with_token(router, service, SyncToken::new())
    }

    /// Blocks without a deadline until the sentinel arrives. Fails with
    /// `Disconnected` if the log stream ends first.
    pub fn sync_with_token(&self, router: &LogRouter, service: &str, token: SyncToken) -> Result<Vec<String>> {
        let queue = router.queue(service)?;
        self.consume(&token)?;

        let url = service_url(&self.engine, &self.http, service, self.settings.port, "/")?;
        let request = HttpRequest::get(url).header(self.settings.header.as_str(), token.as_str());
        let response = self.probe.send(&request)?;
        if response.status != 200 {
            return Err(HarnessError::Process(format!(
                "sync request to {service} answered {}: {}",
                response.status, response.body
            )));
        }

        let sentinel = token.sentinel();
        let lines = collect_until(&queue, service, |line| line.trim() == sentinel)?;
        debug!(service, lines = lines.len(), "sync barrier passed");
        Ok(lines)
    }

    /// Like [`SyncBarrier::sync`], but the barrier is the access log entry of
    /// a `GET <access_log_path>?token=<token>` request.
    pub fn sync_access_log(&self, router: &LogRouter, service: &str) -> Result<Vec<String>> {
        let queue = router.queue(service)?;
        let token = SyncToken::new();
        self.consume(&token)?;

        let path = format!("{}?token={}", self.settings.access_log_path, token);
        let url = service_url(&self.engine, &self.http, service, self.settings.access_log_port, &path)?;
        let response = self.probe.send(&HttpRequest::get(url))?;
        if response.status != 200 {
            return Err(HarnessError::Process(format!(
                "{service} returned error (status {}): {}",
                response.status, response.body
            )));
        }

        let entry = access_log_pattern(&self.settings.access_log_path)?;
        collect_until(&queue, service, |line| {
            entry
                .captures(line)
                .and_then(|caps| caps.get(1))
                .is_some_and(|seen| seen.as_str() == token.as_str())
        })
    }

    fn consume(&self, token: &SyncToken) -> Result<()> {
        let mut consumed = self
            .consumed
            .lock()
            .map_err(|_| HarnessError::Process("sync token registry poisoned".to_string()))?;
        if !consumed.insert(token.clone()) {
            return Err(HarnessError::Misuse(format!("sync token {token} was already used")));
        }
        Ok(())
    }
}

fn access_log_pattern(path: &str) -> Result<Regex> {
    Ok(Regex::new(&format!(
        r#""GET {}\?token=(\S+) HTTP/1\.1""#,
        regex::escape(path)
    ))?)
}

fn collect_until(queue: &LogQueue, service: &str, mut is_barrier: impl FnMut(&str) -> bool) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        let Some(line) = queue.pop() else {
            return Err(HarnessError::Disconnected(format!(
                "log stream of {service} ended before the sync barrier"
            )));
        };
        if is_barrier(&line) {
            return Ok(lines);
        }
        lines.push(line);
    }
}

/// Pops lines of `queue` until one matches `pattern`. Lines before the match
/// are consumed.
pub fn wait_for_log_message(queue: &LogQueue, service: &str, pattern: &str, timeout: Duration) -> Result<String> {
    let pattern = Regex::new(pattern)?;
    let started = Instant::now();
    let mut last_line: Option<String> = None;
    loop {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(HarnessError::Timeout {
                what: format!("log message matching {pattern} from {service}"),
                elapsed,
                last_state: last_line.unwrap_or_else(|| "no log lines".to_string()),
            });
        }
        match queue.pop_timeout(timeout - elapsed) {
            Some(line) if pattern.is_match(&line) => return Ok(line),
            Some(line) => last_line = Some(line),
            None if queue.is_closed() && queue.is_empty() => {
                return Err(HarnessError::Disconnected(format!(
                    "log stream of {service} ended while waiting for {pattern}"
                )))
            }
            None => {}
        }
    }
}

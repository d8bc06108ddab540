use crate::config::WorkerSettings;
use crate::engine::Engine;
use crate::error::Result;
use crate::wait::{wait_until, Probe, WaitPolicy};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Process ids of the workers seen in one container at one instant.
pub type WorkerPidSet = BTreeSet<u32>;

/// Keeps the rows whose command starts with `pattern`. A worker that is
/// draining after a reload reports as `<pattern> is shutting down` and still
/// counts.
pub fn select_workers(processes: &[(u32, String)], pattern: &str) -> WorkerPidSet {
    processes
        .iter()
        .filter(|(_, command)| command.trim_start().starts_with(pattern))
        .map(|(pid, _)| *pid)
        .collect()
}

#[derive(Clone)]
pub struct WorkerTracker {
    engine: Engine,
    pattern: String,
    reload_command: Vec<String>,
    drain: WaitPolicy,
    spawn: WaitPolicy,
}

impl WorkerTracker {
    pub fn new(engine: Engine, settings: &WorkerSettings) -> Self {
        let interval = settings.poll_interval();
        Self {
            engine,
            pattern: settings.pattern.clone(),
            reload_command: settings.reload_command.clone(),
            drain: WaitPolicy::new(settings.drain_timeout(), interval),
            spawn: WaitPolicy::new(settings.spawn_timeout(), interval),
        }
    }

    pub fn with_policies(mut self, drain: WaitPolicy, spawn: WaitPolicy) -> Self {
        self.drain = drain;
        self.spawn = spawn;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn snapshot(&self, container: &str) -> Result<WorkerPidSet> {
        let processes = self.engine.top(container)?;
        Ok(select_workers(&processes, &self.pattern))
    }

    /// Waits until none of `before` is alive, then until at least one worker
    /// is. Old and new workers overlap during a reload, so the second check
    /// alone would succeed too early.
    pub fn await_replacement(&self, container: &str, before: &WorkerPidSet) -> Result<WorkerPidSet> {
        wait_until("old workers to exit", self.drain, || {
            let current = self.snapshot(container)?;
            let lingering: Vec<u32> = current.intersection(before).copied().collect();
            if lingering.is_empty() {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::Pending(format!("still running: {lingering:?}")))
            }
        })?;
        let fresh = wait_until("new workers to start", self.spawn, || {
            let current = self.snapshot(container)?;
            if current.is_empty() {
                Ok(Probe::Pending("no workers".to_string()))
            } else {
                Ok(Probe::Ready(current))
            }
        })?;
        debug!(container, ?before, ?fresh, "workers replaced");
        Ok(fresh)
    }

    /// Snapshots the workers, signals `service` to reload and waits for the
    /// replacement to finish.
    pub fn reload(&self, service: &str, container: &str) -> Result<WorkerPidSet> {
        // must precede the signal, or workers already being replaced would
        // satisfy the drain check
        let before = self.snapshot(container)?;
        let argv: Vec<&str> = self.reload_command.iter().map(String::as_str).collect();
        self.engine.exec_checked(service, &argv, None)?;
        info!(service, workers = ?before, "reload signalled");
        self.await_replacement(container, &before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerSettings;
    use crate::error::HarnessError;
    use crate::testing::{ok_output, FakeRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const HEADER: &str = "PID CMD\n";

    fn top(rows: &[(u32, &str)]) -> String {
        let mut text = HEADER.to_string();
        for (pid, cmd) in rows {
            text.push_str(&format!("{pid} {cmd}\n"));
        }
        text
    }

    /// Each `docker top` call answers with the next scripted listing; the
    /// last one repeats.
    fn scripted(listings: Vec<String>) -> (WorkerTracker, Arc<FakeRunner>, Arc<AtomicUsize>) {
        let tops = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&tops);
        let runner = Arc::new(FakeRunner::new(move |args, _| {
            if args.first().map(String::as_str) == Some("top") {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                ok_output(&listings[n.min(listings.len() - 1)])
            } else {
                ok_output("")
            }
        }));
        let engine = Engine::new(runner.clone(), &DockerSettings::default(), "test");
        let policy = WaitPolicy::new(Duration::from_millis(200), Duration::from_millis(1));
        let tracker = WorkerTracker::new(engine, &WorkerSettings::default()).with_policies(policy, policy);
        (tracker, runner, tops)
    }

    #[test]
    fn selects_running_and_draining_workers() {
        let processes = vec![
            (1, "nginx: master process nginx".to_string()),
            (10, "nginx: worker process".to_string()),
            (11, "nginx: worker process is shutting down".to_string()),
            (12, "sh -c nginx: worker process".to_string()),
        ];
        let workers = select_workers(&processes, "nginx: worker process");
        assert_eq!(workers, WorkerPidSet::from([10, 11]));
    }

    #[test]
    fn replacement_waits_for_old_workers_to_drain() {
        let (tracker, _, tops) = scripted(vec![
            top(&[(1, "nginx: master process"), (10, "nginx: worker process is shutting down"), (11, "nginx: worker process"), (12, "nginx: worker process"), (13, "nginx: worker process")]),
            top(&[(1, "nginx: master process"), (11, "nginx: worker process is shutting down"), (12, "nginx: worker process"), (13, "nginx: worker process")]),
            top(&[(1, "nginx: master process"), (12, "nginx: worker process"), (13, "nginx: worker process")]),
        ]);
        let fresh = tracker
            .await_replacement("c1", &WorkerPidSet::from([10, 11]))
            .unwrap();
        assert_eq!(fresh, WorkerPidSet::from([12, 13]));
        // three drain polls, one spawn poll
        assert_eq!(tops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unchanged_workers_time_out() {
        let listing = top(&[(10, "nginx: worker process"), (11, "nginx: worker process")]);
        let (tracker, _, _) = scripted(vec![listing]);
        let before = tracker.snapshot("c1").unwrap();
        let err = tracker.await_replacement("c1", &before).expect_err("no reload");
        match err {
            HarnessError::Timeout { what, last_state, .. } => {
                assert_eq!(what, "old workers to exit");
                assert!(last_state.contains("10"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_new_workers_time_out_in_second_phase() {
        let (tracker, _, _) = scripted(vec![top(&[(1, "nginx: master process")])]);
        let err = tracker
            .await_replacement("c1", &WorkerPidSet::from([10]))
            .expect_err("no workers");
        assert!(matches!(err, HarnessError::Timeout { ref what, .. } if what == "new workers to start"));
    }

    #[test]
    fn reload_snapshots_before_signalling() {
        let (tracker, runner, _) = scripted(vec![
            top(&[(10, "nginx: worker process")]),
            top(&[(12, "nginx: worker process")]),
        ]);
        let fresh = tracker.reload("nginx", "c1").unwrap();
        assert_eq!(fresh, WorkerPidSet::from([12]));
        let snapshot = runner.position(&["top", "c1"]).unwrap();
        let signal = runner.position(&["nginx", "-s", "reload"]).unwrap();
        assert!(snapshot < signal);
    }
}

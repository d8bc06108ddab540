use crate::classify::resolve_declared;
use crate::error::{HarnessError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct QueueState {
    lines: VecDeque<String>,
    closed: bool,
}

/// Unbounded FIFO of one service's log payloads. The bring-up reader is the
/// only writer.
#[derive(Debug, Default)]
pub struct LogQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl LogQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: String) {
        let mut state = self.lock();
        state.lines.push_back(line);
        self.available.notify_all();
    }

    /// Blocks until a line is available. Returns `None` only once the queue
    /// has been closed and everything pushed before that has been consumed.
    pub fn pop(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if let Some(line) = state.lines.pop_front() {
                return Some(line);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(line) = state.lines.pop_front() {
                return Some(line);
            }
            let now = Instant::now();
            if state.closed || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    pub fn try_pop(&self) -> Option<String> {
        self.lock().lines.pop_front()
    }

    pub fn drain(&self) -> Vec<String> {
        self.lock().lines.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// One queue per declared service, created before any line is routed.
#[derive(Debug)]
pub struct LogRouter {
    services: Vec<String>,
    queues: BTreeMap<String, Arc<LogQueue>>,
}

impl LogRouter {
    pub fn new(services: &[String]) -> Self {
        let queues = services
            .iter()
            .map(|service| (service.clone(), Arc::new(LogQueue::new())))
            .collect();
        Self {
            services: services.to_vec(),
            queues,
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn queue(&self, service: &str) -> Result<Arc<LogQueue>> {
        self.queues
            .get(service)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownService(service.to_string()))
    }

    pub fn resolve(&self, name: &str) -> Option<&String> {
        resolve_declared(name, &self.services)
    }

    /// A line attributed to a service outside the topology means the log
    /// prefix was misread; that is reported instead of dropped.
    pub fn route(&self, service: &str, payload: String) -> Result<()> {
        let declared = self.resolve(service).ok_or_else(|| {
            HarnessError::Protocol(format!(
                "log line attributed to undeclared service {service:?}; declared: {:?}",
                self.services
            ))
        })?;
        self.queue(declared)?.push(payload);
        Ok(())
    }

    pub fn close_all(&self) {
        for queue in self.queues.values() {
            queue.close();
        }
    }
}

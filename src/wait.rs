use crate::error::{HarnessError, Result};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of one poll. `Pending` carries a description of what was seen so
/// that a timeout can report the last observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

pub fn wait_until<T, F>(what: &str, policy: WaitPolicy, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Probe<T>>,
{
    let started = Instant::now();
    let mut polls = 0u64;
    loop {
        polls += 1;
        match probe()? {
            Probe::Ready(value) => {
                debug!(what, polls, elapsed_ms = started.elapsed().as_millis() as u64, "wait satisfied");
                return Ok(value);
            }
            Probe::Pending(state) => {
                let elapsed = started.elapsed();
                if elapsed >= policy.timeout {
                    return Err(HarnessError::Timeout {
                        what: what.to_string(),
                        elapsed,
                        last_state: state,
                    });
                }
                trace!(what, polls, state = %state, "still waiting");
                thread::sleep(policy.interval.min(policy.timeout - elapsed));
            }
        }
    }
}

/// Calls `attempt` up to `attempts` times, pausing between failures, and
/// returns the last error if none succeeds.
pub fn retry<T, F>(what: &str, attempts: u32, pause: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut number = 1;
    loop {
        match attempt(number) {
            Ok(value) => return Ok(value),
            Err(err) if number >= attempts => {
                debug!(what, attempts, error = %err, "retries exhausted");
                return Err(err);
            }
            Err(err) => {
                trace!(what, attempt = number, error = %err, "retrying");
                number += 1;
                thread::sleep(pause);
            }
        }
    }
}

use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

/// Append-only JSON-lines record of everything the harness observed for one
/// environment: classified engine output, timings, free-form notes.
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(Mutex::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record<T: Serialize>(&self, kind: &str, fields: &T) {
        let Some(file) = &self.file else {
            return;
        };
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "fields": fields,
        });
        let mut line = entry.to_string();
        line.push('\n');
        let written = match file.lock() {
            Ok(mut file) => file.write_all(line.as_bytes()).and_then(|_| file.flush()),
            Err(_) => return,
        };
        if let Err(err) = written {
            warn!(error = %err, "failed to append to journal");
        }
    }

    pub fn note(&self, message: &str) {
        self.record("note", &json!({ "message": message }));
    }

    pub fn timed<T>(&self, what: &str, section: impl FnOnce() -> T) -> T {
        let before = Instant::now();
        let result = section();
        let seconds = before.elapsed().as_secs_f64();
        info!(what, seconds, "section finished");
        self.record("duration", &json!({ "what": what, "seconds": seconds }));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn records_one_json_object_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("test.log");
        let journal = Journal::open(&path).unwrap();
        journal.record("service_log", &json!({"service": "nginx", "payload": "hi"}));
        journal.note("bring-up finished");

        let entries = entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["kind"], "service_log");
        assert_eq!(entries[0]["fields"]["service"], "nginx");
        assert_eq!(entries[1]["fields"]["message"], "bring-up finished");
        assert!(entries[0]["ts"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn timed_returns_section_result_and_records_duration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.log");
        let journal = Journal::open(&path).unwrap();
        let value = journal.timed("answer", || 42);
        assert_eq!(value, 42);
        let entries = entries(&path);
        assert_eq!(entries[0]["kind"], "duration");
        assert_eq!(entries[0]["fields"]["what"], "answer");
    }

    #[test]
    fn disabled_journal_is_silent() {
        let journal = Journal::disabled();
        journal.note("nothing happens");
        assert!(journal.path().is_none());
    }
}

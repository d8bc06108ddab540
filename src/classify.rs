//! Classification of `docker compose up` / `docker compose down` output.
//!
//! Compose has printed two dialects over time: the legacy one
//! (`Creating test_nginx_1 ... done`, `test_nginx_1 | payload`) and the
//! current one (`Container test-nginx-1  Created`, `nginx-1  | payload`).
//! Both have been seen interleaved in the same output, so the dialect is
//! decided for every line on its own.

use crate::error::{HarnessError, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    ServiceLog { service: String, payload: String },
    BeginCreate { container: String },
    FinishCreate { container: String },
    AttachToLogs { containers: Vec<String> },
    ImageBuilt { image: String },
    Other { payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TeardownEvent {
    BeginStop { container: String },
    FinishStop { container: String },
    BeginRemove { container: String },
    FinishRemove { container: String },
    BeginRemoveNetwork { network: String },
    FinishRemoveNetwork { network: String },
    Other { payload: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Underscore,
    Hyphen,
}

impl Delimiter {
    pub fn as_char(self) -> char {
        match self {
            Self::Underscore => '_',
            Self::Hyphen => '-',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            '_' => Some(Self::Underscore),
            '-' => Some(Self::Hyphen),
            _ => None,
        }
    }

    /// Container names must use exactly one of the two delimiters.
    pub fn of_container(container: &str) -> Result<Self> {
        match (container.contains('_'), container.contains('-')) {
            (true, true) => Err(HarnessError::Protocol(format!(
                "container name {container:?} contains both underscores and hyphens; cannot tell which is the delimiter"
            ))),
            (true, false) => Ok(Self::Underscore),
            (false, true) => Ok(Self::Hyphen),
            (false, false) => Err(HarnessError::Protocol(format!(
                "container name {container:?} contains neither underscores nor hyphens"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    project: String,
}

impl OutputClassifier {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn classify(&self, line: &str) -> LogEvent {
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(event) = self.match_service_log(line) {
            return event;
        }
        if let Some(event) = match_legacy_create(line) {
            return event;
        }
        if let Some(event) = match_container_state(line) {
            return event;
        }
        if let Some(containers) = line.trim().strip_prefix("Attaching to ") {
            let containers: Vec<String> = containers
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            if !containers.is_empty() {
                return LogEvent::AttachToLogs { containers };
            }
        }
        if let Some(image) = single_token(line.trim().strip_prefix("Successfully built ")) {
            return LogEvent::ImageBuilt { image };
        }
        LogEvent::Other {
            payload: line.to_string(),
        }
    }

    /// `<name><delim><replica> | <payload>` where `<name>` may carry the
    /// project prefix.
    fn match_service_log(&self, line: &str) -> Option<LogEvent> {
        let bar = line.find('|')?;
        let head = line[..bar].trim_end();
        if head.is_empty() || head.starts_with(char::is_whitespace) {
            return None;
        }
        if head.contains(char::is_whitespace) {
            return None;
        }
        let rest = &line[bar + 1..];
        let payload = match rest.strip_prefix(' ') {
            Some(payload) => payload,
            None if rest.is_empty() => "",
            None => return None,
        };
        let without_replica = head.trim_end_matches(|c: char| c.is_ascii_digit());
        if without_replica.len() == head.len() {
            return None;
        }
        let delimiter = Delimiter::from_char(without_replica.chars().last()?)?;
        let name = &without_replica[..without_replica.len() - 1];
        if name.is_empty() {
            return None;
        }
        Some(LogEvent::ServiceLog {
            service: self.strip_project(name, delimiter).to_string(),
            payload: payload.to_string(),
        })
    }

    fn strip_project<'a>(&self, name: &'a str, delimiter: Delimiter) -> &'a str {
        let prefix = format!("{}{}", self.project, delimiter.as_char());
        match name.strip_prefix(prefix.as_str()) {
            Some(rest) if !rest.is_empty() => rest,
            _ => name,
        }
    }

    /// Maps a container name such as `test_foo_bar_1` or `test-foo-bar-1` to
    /// the service part (`foo_bar` / `foo-bar`).
    pub fn container_service_name(&self, container: &str) -> Result<String> {
        let delimiter = Delimiter::of_container(container)?;
        let d = delimiter.as_char();
        let parts: Vec<&str> = container.split(d).collect();
        if parts.len() < 3 {
            return Err(HarnessError::Protocol(format!(
                "container name {container:?} does not look like <project>{d}<service>{d}<replica>"
            )));
        }
        let project_parts = self.project.split(d).count();
        let skip = if container.starts_with(&format!("{}{d}", self.project))
            && parts.len() > project_parts + 1
        {
            project_parts
        } else {
            1
        };
        Ok(parts[skip..parts.len() - 1].join(&d.to_string()))
    }

    pub fn classify_teardown(&self, line: &str) -> TeardownEvent {
        let line = line.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim();
        if let Some(network) = single_token(trimmed.strip_prefix("Removing network ")) {
            return TeardownEvent::BeginRemoveNetwork { network };
        }
        if let Some((verb, name, done)) = legacy_progress(trimmed) {
            match (verb, done) {
                ("Stopping", true) => return TeardownEvent::FinishStop { container: name },
                ("Stopping", false) => return TeardownEvent::BeginStop { container: name },
                ("Removing", true) => return TeardownEvent::FinishRemove { container: name },
                ("Removing", false) => return TeardownEvent::BeginRemove { container: name },
                _ => {}
            }
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if let [kind, name, state] = tokens.as_slice() {
            let name = name.to_string();
            match (*kind, *state) {
                ("Container", "Stopped") => return TeardownEvent::FinishStop { container: name },
                ("Container", "Stopping") => return TeardownEvent::BeginStop { container: name },
                ("Container", "Removed") => return TeardownEvent::FinishRemove { container: name },
                ("Container", "Removing") => return TeardownEvent::BeginRemove { container: name },
                ("Network", "Removed") => return TeardownEvent::FinishRemoveNetwork { network: name },
                ("Network", "Removing") => return TeardownEvent::BeginRemoveNetwork { network: name },
                _ => {}
            }
        }
        TeardownEvent::Other {
            payload: line.to_string(),
        }
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROJECT_NAME)
    }
}

fn single_token(text: Option<&str>) -> Option<String> {
    let text = text?.trim();
    if text.is_empty() || text.contains(char::is_whitespace) {
        return None;
    }
    Some(text.to_string())
}

/// `<Verb> <name> ...` optionally followed by `done`.
fn legacy_progress(trimmed: &str) -> Option<(&str, String, bool)> {
    let (verb, rest) = trimmed.split_once(' ')?;
    let dots = rest.find("...")?;
    let name = rest[..dots].trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    match rest[dots + 3..].trim() {
        "done" => Some((verb, name.to_string(), true)),
        "" => Some((verb, name.to_string(), false)),
        _ => None,
    }
}

fn match_legacy_create(line: &str) -> Option<LogEvent> {
    let (verb, container, done) = legacy_progress(line.trim())?;
    if verb != "Creating" && verb != "Recreating" {
        return None;
    }
    // the terminated form must win over the bare one
    if done {
        return Some(LogEvent::FinishCreate { container });
    }
    Some(LogEvent::BeginCreate { container })
}

fn match_container_state(line: &str) -> Option<LogEvent> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [kind, name, state] = tokens.as_slice() else {
        return None;
    };
    if *kind != "Container" {
        return None;
    }
    let container = name.to_string();
    match *state {
        "Created" | "Recreated" => Some(LogEvent::FinishCreate { container }),
        "Creating" | "Recreate" => Some(LogEvent::BeginCreate { container }),
        _ => None,
    }
}

/// Finds the declared service a parsed name refers to. An exact match wins;
/// otherwise `_` and `-` are treated as the same character.
pub fn resolve_declared<'a>(name: &str, services: &'a [String]) -> Option<&'a String> {
    if let Some(exact) = services.iter().find(|service| *service == name) {
        return Some(exact);
    }
    let wanted = normalize(name);
    services.iter().find(|service| normalize(service) == wanted)
}

fn normalize(name: &str) -> String {
    name.replace('-', "_")
}

use crate::config::{HttpSettings, Transport};
use crate::engine::Engine;
use crate::error::{HarnessError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Value,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request into the environment.
pub trait HttpProbe: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Runs `curljson.sh` inside the client service. The script prints the curl
/// `--write-out` JSON object, the response headers as JSON and the body as a
/// JSON string, one per line.
pub struct ExecCurlProbe {
    engine: Engine,
    service: String,
    command: String,
}

impl ExecCurlProbe {
    pub fn new(engine: Engine, settings: &HttpSettings) -> Self {
        Self {
            engine,
            service: settings.client_service.clone(),
            command: settings.client_command.clone(),
        }
    }

    pub fn args(&self, request: &HttpRequest) -> Vec<String> {
        let mut argv = vec![self.command.clone(), format!("-X{}", request.method)];
        for (name, value) in &request.headers {
            argv.push("--header".to_string());
            argv.push(format!("{name}: {value}"));
        }
        if request.body.is_some() {
            argv.push("--data-binary".to_string());
            argv.push("@-".to_string());
        }
        argv.push(request.url.clone());
        argv
    }
}

impl HttpProbe for ExecCurlProbe {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let argv = self.args(request);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        debug!(method = %request.method, url = %request.url, "request through client service");
        let input = request.body.as_deref().unwrap_or("");
        let output = self.engine.exec_checked(&self.service, &argv, Some(input))?;
        parse_curljson(&output.stdout_text())
    }
}

pub fn parse_curljson(text: &str) -> Result<HttpResponse> {
    let mut lines = text.split('\n');
    let mut next = |what: &str| {
        lines
            .next()
            .ok_or_else(|| HarnessError::Protocol(format!("curljson.sh output is missing the {what} line")))
    };
    let fields: Value = serde_json::from_str(next("fields")?)?;
    let headers: Value = serde_json::from_str(next("headers")?)?;
    let body: String = serde_json::from_str(next("body")?)?;
    let rest: Vec<&str> = lines.filter(|line| !line.is_empty()).collect();
    if !rest.is_empty() {
        return Err(HarnessError::Protocol(format!(
            "unexpected trailing output from curljson.sh: {rest:?}"
        )));
    }
    let status = fields
        .get("response_code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .ok_or_else(|| HarnessError::Protocol(format!("curljson.sh reported no response_code: {fields}")))?;
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Talks to published ports from the host with a blocking client.
pub struct DirectProbe {
    client: reqwest::blocking::Client,
}

impl DirectProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent("stagehand")
            .build()?;
        Ok(Self { client })
    }
}

impl HttpProbe for DirectProbe {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HarnessError::Misuse(format!("invalid HTTP method {:?}", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        debug!(method = %request.method, url = %request.url, "direct request");
        let response = builder.send()?;
        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).to_string();
            headers.insert(name.as_str().to_string(), Value::String(value));
        }
        let body = response.text()?;
        Ok(HttpResponse {
            status,
            headers: Value::Object(headers),
            body,
        })
    }
}

/// Builds the request URL for `service:port` as seen by the transport.
pub fn service_url(engine: &Engine, settings: &HttpSettings, service: &str, port: u16, path: &str) -> Result<String> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    match settings.transport {
        Transport::Exec => Ok(format!("http://{service}:{port}{path}")),
        Transport::Direct => {
            let published = engine.published_port(service, port)?;
            Ok(format!("http://{published}{path}"))
        }
    }
}

pub fn probe_from_settings(engine: &Engine, settings: &HttpSettings) -> Result<Box<dyn HttpProbe>> {
    let probe: Box<dyn HttpProbe> = match settings.transport {
        Transport::Exec => Box::new(ExecCurlProbe::new(engine.clone(), settings)),
        Transport::Direct => Box::new(DirectProbe::new(settings.timeout())?),
    };
    Ok(probe)
}

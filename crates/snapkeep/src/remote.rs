use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(180);
const SUCCESS_STATUS: u16 = 200;
// Response bodies only feed diagnostics.
const MAX_BODY_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Post => "POST",
            Method::Put => "PUT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self, path: &str) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}{}", self.host, self.port, path)
        } else {
            format!("http://{}:{}{}", self.host, self.port, path)
        }
    }
}

/// Outcome of one control call. Calls never fail past this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCallResult {
    Success { status: u16, body: String },
    Rejected { status: u16, body: String },
    Transport { error: String },
}

impl ControlCallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ControlCallResult::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ControlCallResult::Success { status, .. } | ControlCallResult::Rejected { status, .. } => {
                Some(*status)
            }
            ControlCallResult::Transport { .. } => None,
        }
    }

    /// Turn a failed call into `Error::RemoteCall`, naming what the call was for.
    pub fn into_result(self, what: &str, target: &RemoteEndpoint, path: &str) -> Result<()> {
        let detail = match self {
            ControlCallResult::Success { .. } => return Ok(()),
            ControlCallResult::Rejected { status, body } => {
                format!("response code: {status}\n  response body: {body}")
            }
            ControlCallResult::Transport { error } => format!("error: {error}"),
        };
        Err(Error::RemoteCall {
            what: what.to_string(),
            host: target.host.clone(),
            port: target.port,
            endpoint: path.to_string(),
            detail,
        })
    }
}

/// Administrative API of a store. The HTTP client is the production implementation.
pub trait ControlApi {
    fn target(&self) -> &RemoteEndpoint;
    fn call(&self, method: Method, path: &str, body: Option<&str>) -> ControlCallResult;
}

pub struct RemoteControlClient {
    target: RemoteEndpoint,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl RemoteControlClient {
    pub fn new(target: RemoteEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            target,
            timeout,
            client,
        })
    }

}

impl ControlApi for RemoteControlClient {
    fn target(&self) -> &RemoteEndpoint {
        &self.target
    }

    fn call(&self, method: Method, path: &str, body: Option<&str>) -> ControlCallResult {
        let url = self.target.url(path);
        let mut req = match method {
            Method::Post => self.client.post(&url),
            Method::Put => self
                .client
                .put(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json"),
        };
        if let Some(b) = body {
            req = req.body(b.to_string());
        }

        debug!(%method, %url, "control call");
        let res = match req.send() {
            Ok(res) => res,
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("timed out after {}s: {e}", self.timeout.as_secs())
                } else {
                    e.to_string()
                };
                warn!(%method, %url, "control call failed: {error}");
                return ControlCallResult::Transport { error };
            }
        };

        let status = res.status().as_u16();
        let body = match res.text() {
            Ok(t) => truncate_body(t),
            Err(e) => format!("<unreadable body: {e}>"),
        };
        if status == SUCCESS_STATUS {
            ControlCallResult::Success { status, body }
        } else {
            warn!(%method, %url, status, "control call rejected");
            ControlCallResult::Rejected { status, body }
        }
    }
}

fn truncate_body(mut body: String) -> String {
    if body.chars().count() > MAX_BODY_CHARS {
        body = body.chars().take(MAX_BODY_CHARS).collect();
        body.push_str("...[truncated]");
    }
    body
}

//! Response synthesis.
//!
//! Turns a matched [`ResponsePlan`] into either a reply to write after a
//! delay, or a directive to never answer.

use crate::config::ResponsePlan;
use crate::error::{Error, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Synchronous "read file to string" capability used for `responseFile`.
pub trait FileSource: Send + Sync {
    fn read_to_string(&self, path: &str) -> Result<String>;
}

impl<F> FileSource for F
where
    F: Fn(&str) -> std::io::Result<String> + Send + Sync,
{
    fn read_to_string(&self, path: &str) -> Result<String> {
        self(path).map_err(|source| Error::FileRead {
            path: path.to_string(),
            source,
        })
    }
}

/// Reads response files from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsFileSource {
    base_dir: Option<PathBuf>,
}

impl FsFileSource {
    /// Relative paths are resolved against `base_dir` when one is given.
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl FileSource for FsFileSource {
    fn read_to_string(&self, path: &str) -> Result<String> {
        std::fs::read_to_string(self.resolve(path)).map_err(|source| Error::FileRead {
            path: path.to_string(),
            source,
        })
    }
}

/// Outcome of synthesizing a response plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Write nothing and keep the connection open
    Timeout,
    /// Wait `delay`, then write the reply
    Timed(TimedReply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedReply {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub delay: Duration,
}

/// Resolve status, headers, body and delay for `plan`.
pub fn synthesize(plan: &ResponsePlan, files: &dyn FileSource) -> Reply {
    if plan.simulates_timeout() {
        return Reply::Timeout;
    }

    Reply::Timed(TimedReply {
        status: plan.status.unwrap_or(200),
        headers: plan.headers.clone(),
        body: resolve_body(plan, files),
        delay: Duration::from_millis(plan.response_time.unwrap_or(0)),
    })
}

fn resolve_body(plan: &ResponsePlan, files: &dyn FileSource) -> String {
    if let Some(text) = &plan.response_text {
        return text.clone();
    }
    let Some(path) = &plan.response_file else {
        return String::new();
    };
    match files.read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, "Response file unavailable, replying with an empty body");
            String::new()
        }
    }
}

/// Wait out the reply's delay and hand it back. A [`Reply::Timeout`] never
/// completes; dropping the future is the only way to end it.
pub async fn deliver(reply: Reply) -> TimedReply {
    match reply {
        Reply::Timeout => {
            debug!("Simulating timeout, leaving connection open");
            std::future::pending().await
        }
        Reply::Timed(reply) => {
            if !reply.delay.is_zero() {
                debug!(delay_ms = reply.delay.as_millis() as u64, "Delaying reply");
                tokio::time::sleep(reply.delay).await;
            }
            reply
        }
    }
}

impl TimedReply {
    /// Build the HTTP response. Headers that are not valid HTTP are skipped.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = StatusCode::from_u16(self.status).unwrap_or_else(|_| {
            warn!(status = self.status, "Invalid status code, replying 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });

        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = status;

        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid response header"),
            }
        }

        response
    }
}

/// The reply for requests no mapping matches: 404 with no body.
pub fn not_found() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::util::config::Settings;

/// How a request is sent to the cloud
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Get,
    Post(Option<Value>),
    Put(Option<Value>),
    Delete(Option<Value>),
    /// Multipart POST sending the file as the `file` field
    Upload(PathBuf),
}

/// Retry behavior of a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry on any error, waiting `delay` between attempts
    Persistent {
        connect_timeout: Duration,
        retries: u32,
        delay: Duration,
    },
    /// Single attempt that must complete within the given time
    Bounded(Duration),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Persistent {
            connect_timeout: Duration::from_secs(45),
            retries: 8,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Render the policy as curl options
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::Persistent {
                connect_timeout,
                retries,
                delay,
            } => vec![
                "--connect-timeout".to_owned(),
                connect_timeout.as_secs().to_string(),
                "--retry".to_owned(),
                retries.to_string(),
                "--retry-delay".to_owned(),
                delay.as_secs().to_string(),
                "--retry-all-errors".to_owned(),
            ],
            Self::Bounded(max_time) => {
                let max_time = max_time.as_secs().max(1);
                vec![
                    "--connect-timeout".to_owned(),
                    (max_time - 1).max(1).to_string(),
                    "--retry".to_owned(),
                    "0".to_owned(),
                    "--max-time".to_owned(),
                    max_time.to_string(),
                ]
            }
        }
    }
}

/// A call to an agent API endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path relative to the agent API URL, e.g. `events/`
    pub endpoint: String,
    pub retry: RetryPolicy,
}

impl Request {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>, body: Option<Value>) -> Self {
        Self::new(Method::Post(body), endpoint)
    }

    pub fn put(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put(Some(body)), endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Delete(None), endpoint)
    }

    pub fn upload(endpoint: impl Into<String>, file: &Path) -> Self {
        Self::new(Method::Upload(file.to_path_buf()), endpoint)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The JSON body, or an empty object if the body was not JSON
    pub body: Value,
    pub status: StatusCode,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(
        "Cert {} and key {key} seem to be inconsistent (possibly because of CPU board missmatch)!",
        .cert.display()
    )]
    ClientCert { cert: PathBuf, key: String },

    #[error("{endpoint} Network error while accessing {base_url}")]
    Network { endpoint: String, base_url: String },

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("HTTP client failed ({status}): {stderr}")]
    Process { status: ExitStatus, stderr: String },

    #[error("Failed to run HTTP client: {0}")]
    Spawn(#[from] io::Error),

    #[error("Invalid data in response: {0}")]
    InvalidData(String),
}

impl TransportError {
    /// Errors that no amount of retrying will fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ClientCert { .. })
    }
}

/// A way of sending authenticated requests to the cloud agent API.
///
/// Implementations must fold any poll interval hint found in a response
/// into `settings`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, settings: &Settings, request: Request)
    -> Result<Response, TransportError>;
}

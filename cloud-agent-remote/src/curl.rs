use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, instrument, trace};

use crate::util::config::Settings;

use super::transport::{Method, Request, Response, Transport, TransportError};

/// Separates the response body from the status trailer in curl output
const DATA_DELIMITER: &str = "|||";

const POLL_INTERVAL_HEADER: &str = "x-poll-interval";

/// Hard ceiling for a single curl run, retries included
const PROCESS_TIMEOUT: Duration = Duration::from_secs(360);

// curl exit codes
const CURLE_COULDNT_RESOLVE_HOST: i32 = 6;
const CURLE_COULDNT_CONNECT: i32 = 7;
const CURLE_OPERATION_TIMEDOUT: i32 = 28;
const CURLE_SSL_CERTPROBLEM: i32 = 58;

/// [`Transport`] running one `curl` process per request.
///
/// The client certificate key lives in the crypto chip, so TLS is left to
/// curl and its OpenSSL engine.
#[derive(Debug, Clone)]
pub struct Curl {
    command: Vec<String>,
    timeout: Duration,
}

impl Default for Curl {
    fn default() -> Self {
        Self {
            command: vec!["curl".to_owned()],
            timeout: PROCESS_TIMEOUT,
        }
    }
}

impl Curl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different command line prefix to run curl
    pub fn with_command<S: AsRef<str>>(mut self, command: &[S]) -> Self {
        self.command = command.iter().map(|s| s.as_ref().to_owned()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The curl arguments for a request
    pub fn args(settings: &Settings, request: &Request) -> Vec<String> {
        let mut args = Vec::new();
        match &request.method {
            Method::Get => {}
            Method::Post(body) | Method::Put(body) | Method::Delete(body) => {
                let verb = match request.method {
                    Method::Post(_) => "POST",
                    Method::Put(_) => "PUT",
                    _ => "DELETE",
                };
                args.extend(["-X".to_owned(), verb.to_owned()]);
                if let Some(body) = body {
                    args.extend([
                        "-H".to_owned(),
                        "Content-Type: application/json".to_owned(),
                        "-d".to_owned(),
                        body.to_string(),
                    ]);
                }
            }
            Method::Upload(file) => {
                args.extend([
                    "-X".to_owned(),
                    "POST".to_owned(),
                    "-F".to_owned(),
                    format!("file=@{}", file.display()),
                ]);
            }
        }

        args.extend(request.retry.to_args());
        args.extend([
            "--cert".to_owned(),
            settings.client_cert_file.display().to_string(),
            "--key".to_owned(),
            settings.client_cert_engine_key.clone(),
            "--engine".to_owned(),
            "ateccx08".to_owned(),
            "--key-type".to_owned(),
            "ENG".to_owned(),
            // dump headers to stdout
            "-D".to_owned(),
            "-".to_owned(),
            "-w".to_owned(),
            format!("{DATA_DELIMITER}{{\"code\":\"%{{response_code}}\"}}"),
            format!("{}{}", settings.cloud_agent_url, request.endpoint),
        ]);
        args
    }

    fn classify_failure(
        settings: &Settings,
        request: &Request,
        status: std::process::ExitStatus,
        stderr: &[u8],
    ) -> TransportError {
        match status.code() {
            Some(CURLE_SSL_CERTPROBLEM) => TransportError::ClientCert {
                cert: settings.client_cert_file.clone(),
                key: settings.client_cert_engine_key.clone(),
            },
            Some(CURLE_COULDNT_RESOLVE_HOST | CURLE_COULDNT_CONNECT | CURLE_OPERATION_TIMEDOUT) => {
                debug!(
                    "curl exited with {status}: {}",
                    String::from_utf8_lossy(stderr).trim()
                );
                TransportError::Network {
                    endpoint: request.endpoint.clone(),
                    base_url: settings.cloud_base_url.clone(),
                }
            }
            _ => TransportError::Process {
                status,
                stderr: String::from_utf8_lossy(stderr).trim().to_owned(),
            },
        }
    }
}

#[async_trait]
impl Transport for Curl {
    #[instrument(name = "curl", skip_all, fields(endpoint = %request.endpoint))]
    async fn request(
        &self,
        settings: &Settings,
        request: Request,
    ) -> Result<Response, TransportError> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or_else(|| TransportError::Spawn(std::io::Error::other("empty curl command")))?;
        let args = Self::args(settings, &request);
        trace!("running {program} {}", args.join(" "));

        let child = Command::new(program)
            .args(prefix)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // dropping the future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(Self::classify_failure(
                settings,
                &request,
                output.status,
                &output.stderr,
            ));
        }

        decode_response(settings, &output.stdout)
    }
}

/// Format parts the way they appear in invalid data errors, e.g. `['a', 'b']`
fn format_parts(parts: &[&str]) -> String {
    let quoted: Vec<String> = parts
        .iter()
        .map(|part| {
            let quote = if part.contains('\'') && !part.contains('"') {
                '"'
            } else {
                '\''
            };
            let mut out = String::with_capacity(part.len() + 2);
            out.push(quote);
            for c in part.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if c == quote => {
                        out.push('\\');
                        out.push(c);
                    }
                    c => out.push(c),
                }
            }
            out.push(quote);
            out
        })
        .collect();
    format!("[{}]", quoted.join(", "))
}

fn parse_headers(section: &str) -> HashMap<&str, &str> {
    section
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect()
}

fn parse_status(trailer: &str) -> Option<StatusCode> {
    let trailer: Value = serde_json::from_str(trailer).ok()?;
    let code = match trailer.get("code")? {
        Value::String(s) => s.trim().parse::<u16>().ok()?,
        Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        _ => return None,
    };
    StatusCode::from_u16(code).ok()
}

/// Decode curl output made of headers, the body and a status trailer.
///
/// A poll interval header different from the current setting replaces it.
/// A body that is not JSON decodes as an empty object, the status trailer
/// must always be valid.
pub fn decode_response(settings: &Settings, output: &[u8]) -> Result<Response, TransportError> {
    let output = String::from_utf8_lossy(output);
    let (header_section, rest) = output
        .split_once("\r\n\r\n")
        .ok_or_else(|| TransportError::InvalidData(format_parts(&[output.as_ref()])))?;

    let headers = parse_headers(header_section);
    if let Some(value) = headers.get(POLL_INTERVAL_HEADER) {
        let secs: u64 = value.parse().map_err(|_| {
            TransportError::InvalidData(format!("{POLL_INTERVAL_HEADER}: {value}"))
        })?;
        if settings.request_period.set(Duration::from_secs(secs)) {
            debug!("A new poll interval has been set: {secs}");
        }
    }

    let parts: Vec<&str> = rest.split(DATA_DELIMITER).collect();
    let [body, trailer] = parts.as_slice() else {
        return Err(TransportError::InvalidData(format_parts(&parts)));
    };

    let body = serde_json::from_str(body).unwrap_or_else(|_| Value::Object(Map::new()));
    let status =
        parse_status(trailer).ok_or_else(|| TransportError::InvalidData(format_parts(&parts)))?;

    Ok(Response { body, status })
}

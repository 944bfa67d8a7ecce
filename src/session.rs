use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONNECTION, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info, warn};

use crate::domain::Credentials;
use crate::error::ExportError;

pub const CHUNK_SIZE: usize = 1024 * 1024;
pub const LOGIN_PATH: &str = "/ermrest/authn/session";
const ERROR_EXCERPT_LIMIT: usize = 4096;

/// An open, possibly authenticated, channel to one catalog host.
pub trait CatalogSession: Send + Sync {
    /// Streams the body of `url` into `destination`, returning the number of bytes written.
    fn fetch(&self, url: &str, destination: &Path, accept: Option<&str>)
    -> Result<u64, ExportError>;
}

pub trait Connector: Send + Sync {
    type Session: CatalogSession;

    fn connect(&self, host: &str, credentials: &Credentials)
    -> Result<Self::Session, ExportError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub connect: u32,
    pub read: u32,
    pub backoff: Duration,
    pub statuses: &'static [u16],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect: 5,
            read: 5,
            backoff: Duration::from_secs(1),
            statuses: &[500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `backoff * 2^(attempt - 1)` for the n-th retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }
}

#[derive(Debug, Default)]
struct Attempts {
    connect: u32,
    read: u32,
}

#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    policy: RetryPolicy,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Connector for HttpConnector {
    type Session = HttpSession;

    fn connect(&self, host: &str, credentials: &Credentials) -> Result<HttpSession, ExportError> {
        HttpSession::open(host, credentials, self.policy.clone())
    }
}

#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    policy: RetryPolicy,
}

impl HttpSession {
    pub fn open(
        host: &str,
        credentials: &Credentials,
        policy: RetryPolicy,
    ) -> Result<Self, ExportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("catalog-export/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ExportError::Configuration(err.to_string()))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        match credentials {
            Credentials::Cookie(cookie) => {
                headers.insert(
                    COOKIE,
                    HeaderValue::from_str(cookie)
                        .map_err(|err| ExportError::Configuration(err.to_string()))?,
                );
            }
            Credentials::Token(token) => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|err| ExportError::Configuration(err.to_string()))?,
                );
            }
            Credentials::Anonymous | Credentials::Login { .. } => {}
        }

        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| ExportError::UpstreamHttp(err.to_string()))?;
        let session = Self { client, policy };

        if let Credentials::Login { username, password } = credentials {
            let url = format!("{host}{LOGIN_PATH}");
            let mut attempts = Attempts::default();
            let response = session.send_with_retries(&url, &mut attempts, || {
                session
                    .client
                    .post(&url)
                    .form(&[("username", username.as_str()), ("password", password.as_str())])
            })?;
            let status = response.status().as_u16();
            if status > 203 {
                let message = read_excerpt(response, "session request rejected");
                return Err(ExportError::Authentication { status, message });
            }
            info!(url = %url, "catalog session established");
        }

        Ok(session)
    }

    fn send_with_retries<F>(
        &self,
        url: &str,
        attempts: &mut Attempts,
        mut make_req: F,
    ) -> Result<Response, ExportError>
    where
        F: FnMut() -> RequestBuilder,
    {
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempts.read < self.policy.read && self.policy.is_retryable_status(status)
                    {
                        attempts.read += 1;
                        let delay = self.policy.delay(attempts.read);
                        warn!(url, status, attempt = attempts.read, ?delay, "retrying request");
                        thread::sleep(delay);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) if err.is_connect() && attempts.connect < self.policy.connect => {
                    attempts.connect += 1;
                    let delay = self.policy.delay(attempts.connect);
                    warn!(url, error = %err, attempt = attempts.connect, ?delay, "retrying connection");
                    thread::sleep(delay);
                }
                Err(err)
                    if !err.is_connect()
                        && is_read_error(&err)
                        && attempts.read < self.policy.read =>
                {
                    attempts.read += 1;
                    let delay = self.policy.delay(attempts.read);
                    warn!(url, error = %err, attempt = attempts.read, ?delay, "retrying read");
                    thread::sleep(delay);
                }
                Err(err) => return Err(ExportError::UpstreamHttp(err.to_string())),
            }
        }
    }
}

impl CatalogSession for HttpSession {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        accept: Option<&str>,
    ) -> Result<u64, ExportError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| ExportError::Storage(err.to_string()))?;
        }

        let mut attempts = Attempts::default();
        loop {
            let response = self.send_with_retries(url, &mut attempts, || {
                let request = self.client.get(url);
                match accept {
                    Some(accept) => request.header(ACCEPT, accept),
                    None => request,
                }
            })?;
            let mut response = check_status(url, response)?;

            match write_response_to_file(&mut response, destination) {
                Ok(bytes) => {
                    debug!(url, path = %destination.display(), bytes, "file transfer successful");
                    return Ok(bytes);
                }
                Err(CopyFailure::Read(err)) if attempts.read < self.policy.read => {
                    attempts.read += 1;
                    let delay = self.policy.delay(attempts.read);
                    warn!(url, error = %err, attempt = attempts.read, ?delay, "body read failed, retrying");
                    thread::sleep(delay);
                }
                Err(CopyFailure::Read(err)) => {
                    let _ = fs::remove_file(destination);
                    return Err(ExportError::UpstreamHttp(format!(
                        "reading response from {url}: {err}"
                    )));
                }
                Err(CopyFailure::Write(err)) => {
                    return Err(ExportError::Storage(format!(
                        "writing {}: {err}",
                        destination.display()
                    )));
                }
            }
        }
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, ExportError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = read_excerpt(response, "catalog request failed");
    Err(ExportError::UpstreamTransport {
        url: url.to_string(),
        status,
        message,
    })
}

enum CopyFailure {
    Read(io::Error),
    Write(io::Error),
}

/// Copies `reader` into `destination` one bounded chunk at a time.
fn write_response_to_file<R: Read>(reader: &mut R, destination: &Path) -> Result<u64, CopyFailure> {
    let mut file = File::create(destination).map_err(CopyFailure::Write)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CopyFailure::Read(err)),
        };
        file.write_all(&buffer[..read]).map_err(CopyFailure::Write)?;
        written += read as u64;
    }
    file.flush().map_err(CopyFailure::Write)?;
    Ok(written)
}

fn is_read_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_body() || err.is_request()
}

/// Reads at most one excerpt's worth of an error body.
fn read_excerpt(response: Response, fallback: &str) -> String {
    let mut buf = Vec::new();
    match response
        .take(ERROR_EXCERPT_LIMIT as u64 + 1)
        .read_to_end(&mut buf)
    {
        Ok(_) => excerpt(String::from_utf8_lossy(&buf).into_owned()),
        Err(_) => fallback.to_string(),
    }
}

pub fn excerpt(mut text: String) -> String {
    if text.len() > ERROR_EXCERPT_LIMIT {
        let mut cut = ERROR_EXCERPT_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

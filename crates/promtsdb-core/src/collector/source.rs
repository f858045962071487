//! Metrics sources: where a scrape gets its exposition text from.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

use crate::exposition::{ParseError, parse_text};
use crate::model::MetricFamily;
use crate::util::now_ms;

/// Default location of the Docker daemon metrics socket.
pub const DEFAULT_METRICS_SOCKET: &str = "/run/docker/metrics.sock";

/// Default URL path of the metrics endpoint.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

const ACCEPT_TEXT: &str = "text/plain;version=0.0.4";

/// Error type for a failed scrape.
#[derive(Debug)]
pub enum ScrapeError {
    /// Could not connect to the socket.
    Connect(std::io::Error),
    /// A bounded phase of the request ran out of time.
    Timeout(&'static str),
    /// HTTP protocol or connection failure.
    Http(String),
    /// The endpoint answered with a non-success status.
    Status(u16),
    /// The response body is not valid UTF-8.
    Body(String),
    /// The response body is not valid exposition text.
    Parse(ParseError),
}

impl ScrapeError {
    /// Transport errors mean the metrics source is unreachable, as opposed to a bad
    /// answer from a reachable source.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ScrapeError::Connect(_) | ScrapeError::Timeout(_) | ScrapeError::Http(_)
        )
    }
}

impl std::fmt::Display for ScrapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrapeError::Connect(e) => write!(f, "connect failed: {}", e),
            ScrapeError::Timeout(phase) => write!(f, "{} timed out", phase),
            ScrapeError::Http(msg) => write!(f, "HTTP error: {}", msg),
            ScrapeError::Status(code) => write!(f, "unexpected HTTP status {}", code),
            ScrapeError::Body(msg) => write!(f, "invalid response body: {}", msg),
            ScrapeError::Parse(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ScrapeError {}

impl From<ParseError> for ScrapeError {
    fn from(e: ParseError) -> Self {
        ScrapeError::Parse(e)
    }
}

impl From<hyper::Error> for ScrapeError {
    fn from(e: hyper::Error) -> Self {
        ScrapeError::Http(e.to_string())
    }
}

/// Something that can be scraped for metric families.
///
/// Implemented by [`UnixSocketSource`] in production and by in-memory fakes in tests.
pub trait MetricsSource: Send + Sync + 'static {
    fn scrape(&self) -> impl Future<Output = Result<Vec<MetricFamily>, ScrapeError>> + Send;
}

/// Timeouts applied to a single scrape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrapeTimeouts {
    /// Connecting to the socket.
    pub dial: Duration,
    /// The whole request, from sending it to reading the last body byte.
    pub request: Duration,
    /// Waiting for the response status line and headers.
    pub response_header: Duration,
}

impl Default for ScrapeTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_millis(100),
            request: Duration::from_millis(500),
            response_header: Duration::from_millis(500),
        }
    }
}

/// Scrapes an HTTP metrics endpoint served on a Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixSocketSource {
    socket_path: PathBuf,
    url_path: String,
    timeouts: ScrapeTimeouts,
}

impl UnixSocketSource {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            url_path: DEFAULT_METRICS_PATH.to_string(),
            timeouts: ScrapeTimeouts::default(),
        }
    }

    pub fn with_url_path(mut self, path: impl Into<String>) -> Self {
        self.url_path = path.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: ScrapeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Fetches the raw exposition text.
    pub async fn fetch(&self) -> Result<String, ScrapeError> {
        let stream = timeout(self.timeouts.dial, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| ScrapeError::Timeout("dial"))?
            .map_err(ScrapeError::Connect)?;
        let deadline = Instant::now() + self.timeouts.request;

        let (mut sender, conn) = timeout_at(
            deadline,
            hyper::client::conn::http1::handshake(TokioIo::new(stream)),
        )
        .await
        .map_err(|_| ScrapeError::Timeout("request"))??;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "metrics connection closed with error");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(self.url_path.as_str())
            .header(HOST, "localhost")
            .header(ACCEPT, ACCEPT_TEXT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ScrapeError::Http(e.to_string()))?;

        let header_deadline = deadline.min(Instant::now() + self.timeouts.response_header);
        let response = timeout_at(header_deadline, sender.send_request(request))
            .await
            .map_err(|_| ScrapeError::Timeout("response header"))??;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status(status.as_u16()));
        }

        let body = timeout_at(deadline, response.into_body().collect())
            .await
            .map_err(|_| ScrapeError::Timeout("request"))??
            .to_bytes();
        trace!(bytes = body.len(), "metrics body received");

        String::from_utf8(body.to_vec()).map_err(|e| ScrapeError::Body(e.to_string()))
    }
}

impl MetricsSource for UnixSocketSource {
    async fn scrape(&self) -> Result<Vec<MetricFamily>, ScrapeError> {
        let text = self.fetch().await?;
        Ok(parse_text(&text, now_ms())?)
    }
}

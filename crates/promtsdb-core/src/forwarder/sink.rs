//! Line sinks: where converted wire lines end up.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::net::TcpStream;
use tracing::{error, info};

/// Upper bound for the first dial at startup.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a re-dial attempt, so a black-holed host cannot stall the forwarder.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);

async fn dial(addr: &str, limit: Duration) -> io::Result<TcpStream> {
    tokio::time::timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

/// Destination for wire lines. Each call writes one line plus `\n`.
///
/// Errors are returned to the caller instead of being swallowed; the forwarder
/// decides how to report them.
pub trait LineSink: Send + 'static {
    fn write_line(&mut self, line: &str) -> impl Future<Output = io::Result<()>> + Send;
}

fn terminated(line: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    buf
}

/// Writes lines to any async writer, flushing after each line.
///
/// Used for dry-run output on stdout and as an in-memory sink in tests.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> LineSink for WriterSink<W> {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(&terminated(line)).await?;
        self.writer.flush().await
    }
}

/// One long-lived TCP connection to the OpenTSDB telnet endpoint.
///
/// Without reconnect, a connection that failed to open (or broke) stays down and
/// every write fails with [`io::ErrorKind::NotConnected`] or the original I/O error.
/// With reconnect, the next write after a failure dials again.
#[derive(Debug)]
pub struct TcpSink {
    addr: String,
    stream: Option<TcpStream>,
    reconnect: bool,
}

impl TcpSink {
    /// Dials `addr` once, giving up after [`CONNECT_TIMEOUT`]. A failure is logged and
    /// leaves the sink disconnected.
    pub async fn connect(addr: impl Into<String>) -> Self {
        Self::connect_within(addr, CONNECT_TIMEOUT).await
    }

    pub async fn connect_within(addr: impl Into<String>, limit: Duration) -> Self {
        let addr = addr.into();
        let stream = match dial(&addr, limit).await {
            Ok(stream) => {
                info!(%addr, "connected to OpenTSDB");
                Some(stream)
            }
            Err(e) => {
                error!(%addr, error = %e, "failed to connect to OpenTSDB");
                None
            }
        };
        Self {
            addr,
            stream,
            reconnect: false,
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn redial(&mut self) -> io::Result<()> {
        let stream = dial(&self.addr, RECONNECT_TIMEOUT).await?;
        info!(addr = %self.addr, "reconnected to OpenTSDB");
        self.stream = Some(stream);
        Ok(())
    }
}

impl LineSink for TcpSink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.stream.is_none() && self.reconnect {
            self.redial().await?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("not connected to {}", self.addr),
            ));
        };
        if let Err(e) = stream.write_all(&terminated(line)).await {
            if self.reconnect {
                self.stream = None;
            }
            return Err(e);
        }
        Ok(())
    }
}

/// The forwarder's output: the network, or stdout in dry-run mode.
#[derive(Debug)]
pub enum Destination {
    Tcp(TcpSink),
    Stdout(WriterSink<Stdout>),
}

impl Destination {
    /// Picks the output for the daemon. Dry run never touches the network.
    pub async fn open(dry_run: bool, addr: &str, reconnect: bool) -> Self {
        if dry_run {
            info!("dry run, writing lines to stdout");
            Destination::stdout()
        } else {
            Destination::Tcp(TcpSink::connect(addr).await.with_reconnect(reconnect))
        }
    }

    pub fn stdout() -> Self {
        Destination::Stdout(WriterSink::new(tokio::io::stdout()))
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Destination::Stdout(_))
    }
}

impl LineSink for Destination {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Destination::Tcp(sink) => sink.write_line(line).await,
            Destination::Stdout(sink) => sink.write_line(line).await,
        }
    }
}

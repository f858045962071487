//! Draining the queue into the remote store.
//!
//! The [`Forwarder`] takes families off the queue in arrival order, tags them with the
//! local hostname, converts them to OpenTSDB lines and writes each line to its
//! [`LineSink`] immediately. Write errors are counted and logged; they never stop
//! the loop.

mod sink;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::MetricFamily;
use crate::opentsdb::{has_tags, to_put_lines};
use crate::queue::QueueReceiver;

pub use sink::{CONNECT_TIMEOUT, Destination, LineSink, TcpSink, WriterSink};

/// Label attached to every sample before conversion.
pub const HOSTNAME_LABEL: &str = "hostname";

/// Write errors are logged on the first occurrence and then every this many.
const WRITE_ERROR_LOG_EVERY: u64 = 1000;

/// Counters kept by a forwarder over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Families taken off the queue.
    pub families: u64,
    /// Lines accepted by the sink.
    pub lines: u64,
    /// Lines the sink failed to write.
    pub write_errors: u64,
    /// Lines sent without any tag, which OpenTSDB refuses.
    pub untagged: u64,
}

pub struct Forwarder<S> {
    sink: S,
    hostname: Option<String>,
    stats: ForwarderStats,
}

impl<S: LineSink> Forwarder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            hostname: None,
            stats: ForwarderStats::default(),
        }
    }

    /// Sets the value of the `hostname` label. `None` omits the label.
    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Converts one family and writes its lines in order.
    pub async fn forward(&mut self, mut family: MetricFamily) {
        if let Some(hostname) = &self.hostname {
            family.add_label(HOSTNAME_LABEL, hostname);
        }
        self.stats.families += 1;

        for line in to_put_lines(&family) {
            if !has_tags(&line) {
                self.stats.untagged += 1;
                if self.stats.untagged == 1 {
                    warn!(metric = %family.name, "line has no tags, OpenTSDB will reject it");
                }
            }
            match self.sink.write_line(&line).await {
                Ok(()) => self.stats.lines += 1,
                Err(e) => {
                    self.stats.write_errors += 1;
                    let errors = self.stats.write_errors;
                    if errors == 1 || errors % WRITE_ERROR_LOG_EVERY == 0 {
                        warn!(error = %e, write_errors = errors, "failed to write line");
                    } else {
                        debug!(error = %e, "failed to write line");
                    }
                }
            }
        }
    }

    /// Forwards families until the queue closes or `cancel` fires.
    ///
    /// On cancellation, families already sitting in the queue are still forwarded.
    /// Returns the forwarder so callers can inspect its stats and sink.
    pub async fn run(mut self, mut queue: QueueReceiver, cancel: CancellationToken) -> Self {
        info!(hostname = ?self.hostname, "forwarder started");

        loop {
            let family = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.pop() => match next {
                    Some(family) => family,
                    None => {
                        info!("queue closed");
                        self.log_stopped();
                        return self;
                    }
                },
            };
            self.forward(family).await;
        }

        let mut drained: u64 = 0;
        while let Some(family) = queue.try_pop() {
            self.forward(family).await;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "forwarded queued families before shutdown");
        }
        self.log_stopped();
        self
    }

    fn log_stopped(&self) {
        info!(
            families = self.stats.families,
            lines = self.stats.lines,
            write_errors = self.stats.write_errors,
            untagged = self.stats.untagged,
            "forwarder stopped"
        );
    }
}

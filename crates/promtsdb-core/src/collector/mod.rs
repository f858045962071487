//! Periodic scraping of the local metrics source.
//!
//! The [`Collector`] runs one sequential loop: wait for the next tick, scrape, push
//! every family onto the queue in scrape order. Ticks never overlap; a tick that is
//! missed while the previous one is still pushing (queue full) is skipped.
//!
//! A transport failure ends the loop with a [`ScrapeError`]. Whoever spawned the
//! collector decides what happens next; the daemon shuts down. Any other scrape
//! failure only skips the current tick.

mod source;

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::QueueSender;

pub use source::{
    DEFAULT_METRICS_PATH, DEFAULT_METRICS_SOCKET, MetricsSource, ScrapeError, ScrapeTimeouts,
    UnixSocketSource,
};

/// Default scrape period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Shortest accepted scrape period; shorter values are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Scrapes a [`MetricsSource`] on a fixed period and feeds the queue.
pub struct Collector<S> {
    source: S,
    interval: Duration,
}

impl<S: MetricsSource> Collector<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Sets the scrape period, raised to [`MIN_INTERVAL`] if shorter.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!(?interval, min = ?MIN_INTERVAL, "scrape interval too short, raised");
        }
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs until cancelled, until the queue is closed, or until a transport error.
    ///
    /// The first scrape happens one full period after the call.
    pub async fn run(
        self,
        queue: QueueSender,
        cancel: CancellationToken,
    ) -> Result<(), ScrapeError> {
        let first = tokio::time::Instant::now() + self.interval;
        let mut tick = tokio::time::interval_at(first, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut scrape_count: u64 = 0;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "collector started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(scrape_count, "collector stopped");
                    return Ok(());
                }
                _ = tick.tick() => {}
            }

            let t0 = Instant::now();
            let families = match self.source.scrape().await {
                Ok(families) => families,
                Err(e) if e.is_transport() => {
                    error!(error = %e, "metrics source unreachable");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "scrape failed, skipping tick");
                    continue;
                }
            };

            scrape_count += 1;
            let family_count = families.len();
            for family in families {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(scrape_count, "collector stopped");
                        return Ok(());
                    }
                    pushed = queue.push(family) => {
                        if let Err(e) = pushed {
                            warn!(error = %e, "collector exiting");
                            return Ok(());
                        }
                    }
                }
            }

            let elapsed = t0.elapsed();
            debug!(
                scrape_count,
                families = family_count,
                duration_ms = elapsed.as_millis() as u64,
                "scrape completed"
            );
            if elapsed > self.interval {
                warn!(
                    duration_ms = elapsed.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "scrape exceeded interval, forwarder is falling behind"
                );
            }
        }
    }

    /// Spawns [`Collector::run`] as a task. A transport error is handed to `fatal`.
    pub fn spawn(
        self,
        queue: QueueSender,
        cancel: CancellationToken,
        fatal: mpsc::Sender<ScrapeError>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(queue, cancel).await
                && fatal.send(e).await.is_err()
            {
                warn!("collector failure has no supervisor");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::model::{MetricFamily, MetricType};
    use crate::queue::{QueueReceiver, bounded};

    type Response = Result<Vec<MetricFamily>, ScrapeError>;

    /// Replays scripted responses, then keeps answering with `fallback`.
    struct ScriptedSource {
        script: Mutex<VecDeque<Response>>,
        fallback: Vec<MetricFamily>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(fallback: &[&str]) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = Self {
                script: Mutex::new(VecDeque::new()),
                fallback: fallback.iter().map(|n| family(n)).collect(),
                calls: calls.clone(),
            };
            (source, calls)
        }

        fn then(self, response: Response) -> Self {
            self.script.lock().unwrap().push_back(response);
            self
        }
    }

    impl MetricsSource for ScriptedSource {
        async fn scrape(&self) -> Result<Vec<MetricFamily>, ScrapeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn family(name: &str) -> MetricFamily {
        MetricFamily::new(name, MetricType::Gauge, 0)
    }

    fn refused() -> ScrapeError {
        ScrapeError::Connect(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    }

    async fn take_names(rx: &mut QueueReceiver, n: usize) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..n {
            names.push(rx.pop().await.unwrap().name);
        }
        names
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushes_families_in_scrape_order() {
        let (source, _calls) = ScriptedSource::new(&["a", "b", "c"]);
        let (tx, mut rx) = bounded(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Collector::new(source).run(tx, cancel.clone()));

        let names = take_names(&mut rx, 6).await;
        assert_eq!(names, vec!["a", "b", "c", "a", "b", "c"]);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_scrape_after_one_period() {
        let (source, calls) = ScriptedSource::new(&["a"]);
        let (tx, _rx) = bounded(16);
        let cancel = CancellationToken::new();
        let _task = tokio::spawn(Collector::new(source).run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_ends_loop() {
        let (source, calls) = ScriptedSource::new(&["a"]);
        let source = source.then(Ok(vec![family("first")])).then(Err(refused()));
        let (tx, mut rx) = bounded(16);

        let result = Collector::new(source)
            .run(tx, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ScrapeError::Connect(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rx.pop().await.unwrap().name, "first");
        assert!(rx.pop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_answer_skips_tick() {
        let (source, _calls) = ScriptedSource::new(&["after"]);
        let source = source.then(Err(ScrapeError::Status(500)));
        let (tx, mut rx) = bounded(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Collector::new(source).run(tx, cancel.clone()));

        assert_eq!(rx.pop().await.unwrap().name, "after");
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_throttles_scrapes() {
        let (source, calls) = ScriptedSource::new(&["a", "b", "c"]);
        let (tx, mut rx) = bounded(2);
        let cancel = CancellationToken::new();
        let _task = tokio::spawn(Collector::new(source).run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(20)).await;
        // Blocked pushing "c" of the first scrape.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rx.len(), 2);

        assert_eq!(take_names(&mut rx, 4).await, vec!["a", "b", "c", "a"]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_to_minimum() {
        let (source, calls) = ScriptedSource::new(&["a"]);
        let collector = Collector::new(source).with_interval(Duration::ZERO);
        assert_eq!(collector.interval(), MIN_INTERVAL);

        let (tx, mut rx) = bounded(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(tx, cancel.clone()));

        assert_eq!(take_names(&mut rx, 3).await, vec!["a", "a", "a"]);
        assert!(calls.load(Ordering::SeqCst) >= 3);
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_reports_fatal_error() {
        let (source, _calls) = ScriptedSource::new(&[]);
        let source = source.then(Err(refused()));
        let (tx, _rx) = bounded(4);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        let handle = Collector::new(source)
            .with_interval(Duration::from_millis(500))
            .spawn(tx, CancellationToken::new(), fatal_tx);

        let err = fatal_rx.recv().await.unwrap();
        assert!(err.is_transport());
        handle.await.unwrap();
    }
}

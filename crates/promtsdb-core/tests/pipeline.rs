//! End-to-end tests: metrics socket → collector → queue → forwarder, driven through
//! the plugin control socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use promtsdb_core::collector::{Collector, ScrapeError, UnixSocketSource};
use promtsdb_core::control::{self, START_METRICS_PATH, STOP_METRICS_PATH};
use promtsdb_core::forwarder::{Forwarder, WriterSink};
use promtsdb_core::lifecycle::Lifecycle;
use promtsdb_core::queue::{self, QUEUE_CAPACITY};

// =============================================================================
// Test Helpers
// =============================================================================

const INTERVAL: Duration = Duration::from_millis(100);

struct Harness {
    _dir: tempfile::TempDir,
    plugin_socket: PathBuf,
    lines: Lines<BufReader<DuplexStream>>,
    scrapes: Arc<AtomicUsize>,
    fatal: mpsc::Receiver<ScrapeError>,
    cancel: CancellationToken,
    forwarder: JoinHandle<Forwarder<WriterSink<DuplexStream>>>,
}

/// Serves `body` on `/metrics` and counts requests.
fn serve_metrics(path: &Path, body: &'static str) -> Arc<AtomicUsize> {
    let scrapes = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/metrics",
            get(move |State(scrapes): State<Arc<AtomicUsize>>| async move {
                scrapes.fetch_add(1, Ordering::SeqCst);
                body
            }),
        )
        .with_state(scrapes.clone());
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    scrapes
}

/// Wires the whole agent the way the daemon does, with the forwarder writing into an
/// in-memory pipe instead of TCP.
async fn start_agent(metrics_body: Option<&'static str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let metrics_socket = dir.path().join("metrics.sock");
    let plugin_socket = dir.path().join("plugins").join("metrics.sock");

    let scrapes = match metrics_body {
        Some(body) => serve_metrics(&metrics_socket, body),
        None => Arc::new(AtomicUsize::new(0)),
    };

    let cancel = CancellationToken::new();
    let (queue_tx, queue_rx) = queue::bounded(QUEUE_CAPACITY);

    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let forwarder = tokio::spawn(
        Forwarder::new(WriterSink::new(writer))
            .with_hostname(Some("test-host".to_string()))
            .run(queue_rx, cancel.clone()),
    );

    let (fatal_tx, fatal) = mpsc::channel(1);
    let collector = Collector::new(UnixSocketSource::new(&metrics_socket)).with_interval(INTERVAL);
    let collector_cancel = cancel.clone();
    let lifecycle = Arc::new(Lifecycle::new(Box::new(move || {
        collector.spawn(queue_tx, collector_cancel, fatal_tx)
    })));

    let listener = control::bind(&plugin_socket).unwrap();
    tokio::spawn(control::serve(
        listener,
        control::router(lifecycle),
        cancel.clone(),
    ));

    Harness {
        _dir: dir,
        plugin_socket,
        lines: BufReader::new(reader).lines(),
        scrapes,
        fatal,
        cancel,
        forwarder,
    }
}

/// Sends a control request over the plugin socket and returns the response body.
async fn post(socket: &Path, path: &str) -> String {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method("POST")
        .uri(path)
        .header("host", "plugin")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert!(response.status().is_success());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(body.to_vec()).unwrap()
}

async fn next_line(lines: &mut Lines<BufReader<DuplexStream>>) -> String {
    tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("no line forwarded in time")
        .unwrap()
        .expect("forwarder output closed")
}

/// Splits `put <metric> <ts> <rest>` into (metric, ts, rest).
fn split_put(line: &str) -> (&str, i64, &str) {
    let mut parts = line.splitn(4, ' ');
    assert_eq!(parts.next(), Some("put"));
    let metric = parts.next().unwrap();
    let ts = parts.next().unwrap().parse().unwrap();
    (metric, ts, parts.next().unwrap())
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_single_gauge_end_to_end() {
    let mut agent = start_agent(Some("cpu_usage{core=\"0\"} 0.42\n")).await;

    let body = post(&agent.plugin_socket, START_METRICS_PATH).await;
    assert_eq!(body, r#"{"Err":""}"#);

    let line = next_line(&mut agent.lines).await;
    let (metric, ts, rest) = split_put(&line);
    assert_eq!(metric, "cpu_usage");
    assert!(ts > 0);
    assert_eq!(rest, "0.42 core=0 hostname=test-host");

    // Next tick brings the same single line again, nothing else in between.
    let line = next_line(&mut agent.lines).await;
    assert_eq!(split_put(&line).2, "0.42 core=0 hostname=test-host");

    agent.cancel.cancel();
}

#[tokio::test]
async fn test_nothing_flows_before_start() {
    let mut agent = start_agent(Some("up 1\n")).await;

    let early = tokio::time::timeout(INTERVAL * 4, agent.lines.next_line()).await;
    assert!(early.is_err(), "no line may be forwarded before StartMetrics");
    assert_eq!(agent.scrapes.load(Ordering::SeqCst), 0);

    post(&agent.plugin_socket, START_METRICS_PATH).await;
    assert_eq!(split_put(&next_line(&mut agent.lines).await).0, "up");
    agent.cancel.cancel();
}

#[tokio::test]
async fn test_start_twice_runs_one_collector() {
    let mut agent = start_agent(Some("up 1\n")).await;

    post(&agent.plugin_socket, START_METRICS_PATH).await;
    post(&agent.plugin_socket, START_METRICS_PATH).await;

    tokio::time::sleep(INTERVAL * 10 + INTERVAL / 2).await;
    let scrapes = agent.scrapes.load(Ordering::SeqCst);
    assert!(
        (1..=11).contains(&scrapes),
        "expected at most one scrape per tick, got {scrapes}"
    );

    agent.cancel.cancel();
    let forwarder = agent.forwarder.await.unwrap();
    assert!(forwarder.stats().families as usize <= scrapes);
    assert_eq!(forwarder.stats().write_errors, 0);
    assert_eq!(split_put(&next_line(&mut agent.lines).await).0, "up");
}

#[tokio::test]
async fn test_stop_leaves_collector_running() {
    let mut agent = start_agent(Some("up 1\n")).await;

    post(&agent.plugin_socket, START_METRICS_PATH).await;
    next_line(&mut agent.lines).await;

    let body = post(&agent.plugin_socket, STOP_METRICS_PATH).await;
    assert_eq!(body, "{}");

    let before = agent.scrapes.load(Ordering::SeqCst);
    next_line(&mut agent.lines).await;
    next_line(&mut agent.lines).await;
    assert!(agent.scrapes.load(Ordering::SeqCst) > before);

    agent.cancel.cancel();
}

#[tokio::test]
async fn test_unreachable_metrics_socket_is_fatal() {
    let mut agent = start_agent(None).await;

    post(&agent.plugin_socket, START_METRICS_PATH).await;

    let err = tokio::time::timeout(Duration::from_secs(5), agent.fatal.recv())
        .await
        .expect("collector did not report the failure")
        .unwrap();
    assert!(err.is_transport());
    assert!(matches!(err, ScrapeError::Connect(_)));

    agent.cancel.cancel();
    let forwarder = agent.forwarder.await.unwrap();
    assert_eq!(forwarder.stats().families, 0);
}

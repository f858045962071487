//! promtsdbd - Docker metrics plugin forwarding to OpenTSDB.
//!
//! Scrapes the Docker daemon's Prometheus endpoint every interval once the daemon
//! sends StartMetrics, converts the samples to OpenTSDB `put` lines and streams them
//! over one TCP connection (or prints them in dry-run mode).

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use promtsdb_core::collector::{
    Collector, DEFAULT_METRICS_PATH, DEFAULT_METRICS_SOCKET, ScrapeTimeouts, UnixSocketSource,
};
use promtsdb_core::control::{self, DEFAULT_PLUGIN_SOCKET};
use promtsdb_core::forwarder::{Destination, Forwarder};
use promtsdb_core::lifecycle::Lifecycle;
use promtsdb_core::queue::{self, QUEUE_CAPACITY};
use promtsdb_core::util::hostname;

/// Docker metrics plugin forwarding to OpenTSDB.
#[derive(Parser)]
#[command(name = "promtsdbd", about = "Docker metrics plugin forwarding to OpenTSDB", version = promtsdb_core::VERSION)]
struct Args {
    /// OpenTSDB host.
    #[arg(long, default_value = "localhost", env = "OPENTSDB_HOST")]
    opentsdb_host: String,

    /// OpenTSDB telnet port.
    #[arg(long, default_value = "4242", env = "OPENTSDB_PORT")]
    opentsdb_port: String,

    /// Print lines to stdout instead of sending them. Only "true" enables it.
    #[arg(long, default_value = "false", env = "DRY_RUN", value_parser = parse_dry_run, action = clap::ArgAction::Set)]
    dry_run: bool,

    /// Unix socket of the Prometheus metrics endpoint.
    #[arg(long, default_value = DEFAULT_METRICS_SOCKET, env = "METRICS_SOCKET")]
    metrics_socket: PathBuf,

    /// URL path of the metrics endpoint.
    #[arg(long, default_value = DEFAULT_METRICS_PATH)]
    metrics_path: String,

    /// Unix socket the plugin control plane listens on.
    #[arg(long, default_value = DEFAULT_PLUGIN_SOCKET, env = "PLUGIN_SOCKET")]
    plugin_socket: PathBuf,

    /// Scrape interval in seconds.
    #[arg(short, long, default_value = "2", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Re-dial OpenTSDB on the next write after a connection failure.
    #[arg(long)]
    reconnect: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_dry_run(s: &str) -> Result<bool, String> {
    Ok(s == "true")
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Logs go to stderr so dry-run output on stdout stays clean.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["promtsdbd", "promtsdb_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    let code = runtime.block_on(async_main(args));
    process::exit(code);
}

/// Resolves on ctrl-c. If the handler cannot be installed, logs and never resolves.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!(error = %e, "failed to install ctrl-c handler, signal shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}

async fn async_main(args: Args) -> i32 {
    info!(version = promtsdb_core::VERSION, "promtsdbd starting");
    let addr = format!("{}:{}", args.opentsdb_host, args.opentsdb_port);
    info!(
        opentsdb = %addr,
        dry_run = args.dry_run,
        metrics_socket = %args.metrics_socket.display(),
        plugin_socket = %args.plugin_socket.display(),
        interval_s = args.interval,
        "config"
    );

    let cancel = CancellationToken::new();
    let (queue_tx, queue_rx) = queue::bounded(QUEUE_CAPACITY);

    // Collector is launched by the first StartMetrics call.
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    let source = UnixSocketSource::new(&args.metrics_socket)
        .with_url_path(args.metrics_path.as_str())
        .with_timeouts(ScrapeTimeouts::default());
    let collector = Collector::new(source).with_interval(Duration::from_secs(args.interval));
    let collector_cancel = cancel.clone();
    let lifecycle = Arc::new(Lifecycle::new(Box::new(move || {
        collector.spawn(queue_tx, collector_cancel, fatal_tx)
    })));

    let listener = match control::bind(&args.plugin_socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %args.plugin_socket.display(), error = %e, "failed to bind control socket");
            return 1;
        }
    };
    let server = control::serve(listener, control::router(lifecycle), cancel.clone());
    tokio::pin!(server);

    // The control socket is already bound, so a slow OpenTSDB dial cannot delay the
    // activation handshake.
    let hostname = hostname();
    if hostname.is_none() {
        warn!("hostname lookup failed, lines will carry no hostname tag");
    }
    let (dry_run, reconnect, forwarder_cancel) = (args.dry_run, args.reconnect, cancel.clone());
    let forwarder = tokio::spawn(async move {
        Forwarder::new(Destination::open(dry_run, &addr, reconnect).await)
            .with_hostname(hostname)
            .run(queue_rx, forwarder_cancel)
            .await
    });

    let (code, server_done) = tokio::select! {
        result = &mut server => match result {
            Ok(()) => (0, true),
            Err(e) => {
                error!(error = %e, "control plane failed");
                (1, true)
            }
        },
        Some(e) = fatal_rx.recv() => {
            error!(error = %e, "metrics scrape failed, shutting down");
            (1, false)
        }
        _ = shutdown_signal() => (0, false),
    };

    info!("Shutting down...");
    cancel.cancel();
    if !server_done && let Err(e) = server.await {
        warn!(error = %e, "control plane shutdown failed");
    }
    match forwarder.await {
        Ok(forwarder) => {
            let stats = forwarder.stats();
            info!(
                families = stats.families,
                lines = stats.lines,
                write_errors = stats.write_errors,
                untagged = stats.untagged,
                "Shutdown complete"
            );
        }
        Err(e) => error!(error = %e, "forwarder task panicked"),
    }
    let _ = std::fs::remove_file(&args.plugin_socket);
    code
}

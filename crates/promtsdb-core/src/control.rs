//! Docker plugin control plane served on a Unix socket.
//!
//! Endpoints (all `POST`, JSON bodies, content type
//! `application/vnd.docker.plugins.v1+json`):
//!
//! | Path                              | Response                                  |
//! |-----------------------------------|-------------------------------------------|
//! | `/Plugin.Activate`                | `{"Implements":["MetricsCollector"]}`     |
//! | `/MetricsCollector.StartMetrics`  | `{"Err":""}`                              |
//! | `/MetricsCollector.StopMetrics`   | `{}`                                      |
//!
//! Request bodies are ignored. Start and stop always report success.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lifecycle::Lifecycle;

/// Default control socket, where the Docker daemon looks for a plugin named `metrics`.
pub const DEFAULT_PLUGIN_SOCKET: &str = "/run/docker/plugins/metrics.sock";

pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

/// Capability announced during the activation handshake.
pub const CAPABILITY: &str = "MetricsCollector";

pub const ACTIVATE_PATH: &str = "/Plugin.Activate";
pub const START_METRICS_PATH: &str = "/MetricsCollector.StartMetrics";
pub const STOP_METRICS_PATH: &str = "/MetricsCollector.StopMetrics";

// ============================================================
// Envelopes
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMetricsResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMetricsResponse {}

/// JSON body with the plugin content type.
struct PluginJson<T>(T);

impl<T: Serialize> IntoResponse for PluginJson<T> {
    fn into_response(self) -> Response {
        let mut response = axum::Json(self.0).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(PLUGIN_CONTENT_TYPE),
        );
        response
    }
}

// ============================================================
// Handlers
// ============================================================

type AppState = State<Arc<Lifecycle>>;

async fn handle_activate() -> PluginJson<Manifest> {
    info!("plugin activation handshake");
    PluginJson(Manifest {
        implements: vec![CAPABILITY.to_string()],
    })
}

async fn handle_start_metrics(State(lifecycle): AppState) -> PluginJson<StartMetricsResponse> {
    let outcome = lifecycle.start();
    info!(?outcome, "got StartMetrics");
    PluginJson(StartMetricsResponse { err: String::new() })
}

async fn handle_stop_metrics(State(lifecycle): AppState) -> PluginJson<StopMetricsResponse> {
    info!("got StopMetrics");
    lifecycle.stop();
    PluginJson(StopMetricsResponse {})
}

// ============================================================
// Server
// ============================================================

/// Builds the control-plane router around a lifecycle.
pub fn router(lifecycle: Arc<Lifecycle>) -> Router {
    Router::new()
        .route(ACTIVATE_PATH, post(handle_activate))
        .route(START_METRICS_PATH, post(handle_start_metrics))
        .route(STOP_METRICS_PATH, post(handle_stop_metrics))
        .with_state(lifecycle)
}

/// Binds the control socket, replacing a stale socket file and creating the parent
/// directory if needed.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed stale control socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Serves `router` on `listener` until `cancel` fires.
pub async fn serve(
    listener: UnixListener,
    router: Router,
    cancel: CancellationToken,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr()
        && let Some(path) = addr.as_pathname()
    {
        info!(path = %path.display(), "control plane listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

//! Start/stop gate for the collector loop.
//!
//! ```text
//!   Idle ──start()──▶ Running ──start()──▶ Running
//!                        │
//!                        └──stop()──▶ Running   (acknowledged, nothing cancelled)
//! ```
//!
//! The first `start()` launches the collector task; later calls are no-ops. `stop()`
//! is accepted and logged but leaves the collector running; the Docker daemon always
//! sees it succeed.

use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawns the collector. Called at most once.
pub type Launch = Box<dyn FnOnce() -> JoinHandle<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
}

/// Result of a [`Lifecycle::start`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

struct Inner {
    launch: Option<Launch>,
    task: Option<JoinHandle<()>>,
}

pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub fn new(launch: Launch) -> Self {
        Self {
            inner: Mutex::new(Inner {
                launch: Some(launch),
                task: None,
            }),
        }
    }

    /// Launches the collector on the first call. Concurrent callers are serialized by
    /// the lock; exactly one of them sees `Idle`.
    pub fn start(&self) -> StartOutcome {
        let mut inner = self.lock();
        match inner.launch.take() {
            Some(launch) => {
                inner.task = Some(launch());
                info!("metrics collection started");
                StartOutcome::Started
            }
            None => {
                debug!("metrics collection already running");
                StartOutcome::AlreadyRunning
            }
        }
    }

    /// Acknowledges a stop request. The collector keeps running.
    pub fn stop(&self) {
        info!(state = ?self.state(), "stop requested, collection keeps running");
    }

    pub fn state(&self) -> LifecycleState {
        if self.lock().launch.is_some() {
            LifecycleState::Idle
        } else {
            LifecycleState::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// True once the launched collector task has exited (after a fatal error or
    /// shutdown).
    pub fn collector_finished(&self) -> bool {
        self.lock().task.as_ref().is_some_and(JoinHandle::is_finished)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning cannot leave `Inner` half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Two-stage shutdown.
//!
//! ```text
//!   root ─┬─ drain ── listening (per controller iteration)
//!         └─ job execution (per job)
//! ```
//!
//! First interrupt: with no job running the root token is cancelled; with a
//! job running the runner switches to run-once and stops listening, letting
//! the job finish. A second interrupt, or a terminate signal at any time,
//! cancels the root token and with it every running job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

/// What a signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Nothing was running; stop now.
    Stop,
    /// Stop accepting jobs, finish the running ones.
    Drain,
    /// Abandon running jobs.
    Abort,
}

pub struct ShutdownController {
    root: CancellationToken,
    drain: CancellationToken,
    once: AtomicBool,
    interrupted: AtomicBool,
    running_jobs: AtomicUsize,
}

impl ShutdownController {
    pub fn new(once: bool) -> Arc<Self> {
        let root = CancellationToken::new();
        let drain = root.child_token();
        Arc::new(Self {
            root,
            drain,
            once: AtomicBool::new(once),
            interrupted: AtomicBool::new(false),
            running_jobs: AtomicUsize::new(0),
        })
    }

    /// Process lifetime.
    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Token for one round of listening for jobs.
    pub fn listening_token(&self) -> CancellationToken {
        self.drain.child_token()
    }

    /// Token for one job. Only a forced shutdown cancels it from here.
    pub fn job_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_once(&self) -> bool {
        self.once.load(Ordering::SeqCst)
    }

    pub fn force_once(&self) {
        self.once.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn has_running_job(&self) -> bool {
        self.running_jobs.load(Ordering::SeqCst) > 0
    }

    /// Mark a job as running until the guard is dropped.
    pub fn job_started(self: &Arc<Self>) -> RunningJob {
        self.running_jobs.fetch_add(1, Ordering::SeqCst);
        RunningJob {
            controller: Arc::clone(self),
        }
    }

    pub fn on_interrupt(&self) -> ShutdownAction {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            tracing::info!("CTRL+C received again, cancel current Job if it is still running");
            self.root.cancel();
            return ShutdownAction::Abort;
        }
        if self.has_running_job() {
            tracing::info!("CTRL+C received, stop accepting new jobs and exit after the current job finishes");
            self.force_once();
            self.drain.cancel();
            ShutdownAction::Drain
        } else {
            tracing::info!("CTRL+C received, no job is running shutdown");
            self.root.cancel();
            ShutdownAction::Stop
        }
    }

    pub fn on_terminate(&self) -> ShutdownAction {
        tracing::info!("Terminate signal received, cancel all jobs");
        self.root.cancel();
        ShutdownAction::Abort
    }
}

/// Keeps a job counted as running.
pub struct RunningJob {
    controller: Arc<ShutdownController>,
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.controller.running_jobs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Feed OS signals into `controller` until the root token is cancelled.
pub async fn listen_for_signals(controller: Arc<ShutdownController>) {
    #[cfg(unix)]
    let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    loop {
        #[cfg(unix)]
        let terminated = async {
            match terminate.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            _ = controller.root().cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for CTRL+C: {}", e);
                    return;
                }
                controller.on_interrupt();
            }
            _ = terminated => {
                controller.on_terminate();
            }
        }
    }
}

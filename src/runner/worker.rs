//! One configured runner instance: connect, recover, listen, run jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolTimings;
use crate::protocol::connection::VssConnection;
use crate::protocol::service::RunnerService;
use crate::protocol::session::{TaskAgentMessage, message_types};
use crate::runner::admission::policy_for_guard;
use crate::runner::backoff::Backoff;
use crate::runner::dispatcher::{JobDispatcher, JobHandle};
use crate::runner::executor::JobExecutor;
use crate::runner::job_run::{self, JobRunStore};
use crate::runner::message_loop::MessageLoop;
use crate::runner::settings::RunnerInstance;
use crate::runner::shutdown::ShutdownController;
use crate::runner::state::AgentState;

/// How a worker iteration ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// The worker cannot go on (registration removed, second job in
    /// run-once mode, missing credentials).
    pub fatal: bool,
    /// Jobs accepted during the iteration.
    pub jobs: usize,
}

pub struct Worker {
    instance: Arc<RunnerInstance>,
    single_instance: bool,
    state: Arc<AgentState>,
    job_runs: Arc<JobRunStore>,
    executor: Arc<dyn JobExecutor>,
    shutdown: Arc<ShutdownController>,
    timings: ProtocolTimings,
    http_timeout: Duration,
    trace: bool,
    service: OnceCell<Arc<dyn RunnerService>>,
}

impl Worker {
    pub fn new(
        instance: RunnerInstance,
        state: Arc<AgentState>,
        job_runs: Arc<JobRunStore>,
        executor: Arc<dyn JobExecutor>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            instance: Arc::new(instance),
            single_instance: true,
            state,
            job_runs,
            executor,
            shutdown,
            timings: ProtocolTimings::default(),
            http_timeout: Duration::from_secs(100),
            trace: false,
            service: OnceCell::new(),
        }
    }

    /// Whether this is the only configured instance; markers left by a
    /// renamed instance are then still attributed to it.
    pub fn with_single_instance(mut self, single: bool) -> Self {
        self.single_instance = single;
        self
    }

    pub fn with_timings(mut self, timings: ProtocolTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Use `service` instead of connecting to the instance's tenant.
    pub fn with_service(mut self, service: Arc<dyn RunnerService>) -> Self {
        self.service = OnceCell::new_with(Some(service));
        self
    }

    pub fn instance(&self) -> &RunnerInstance {
        &self.instance
    }

    fn label(&self) -> String {
        format!("{} ( {} )", self.instance.name(), self.instance.registration_url)
    }

    /// One listening round. `first_iteration` discards sessions persisted
    /// by an earlier process. `listening` stops polling for new jobs; in
    /// run-once mode the worker cancels it itself once it accepted a job.
    pub async fn run(&self, first_iteration: bool, listening: CancellationToken) -> WorkerReport {
        let mut report = WorkerReport::default();
        let (agent, key) = match self.instance.credentials() {
            Ok((agent, key)) => (agent.clone(), key.clone()),
            Err(e) => {
                tracing::error!("Runner {} cannot start: {}", self.label(), e);
                report.fatal = true;
                return report;
            }
        };
        let Some(service) = self.connect(&listening).await else {
            return report;
        };

        match job_run::recover(
            &self.job_runs,
            &self.instance,
            self.single_instance,
            service.as_ref(),
            &self.timings,
            self.shutdown.root(),
        )
        .await
        {
            Ok(0) => {}
            Ok(n) => tracing::info!("Reported {} unfinished job(s) of {}", n, self.label()),
            Err(e) => tracing::warn!("Failed to clean up jobrun.json: {}", e),
        }

        let mut messages = MessageLoop::new(
            Arc::clone(&service),
            Arc::clone(&self.state),
            agent,
            key,
            self.timings.clone(),
        )
        .with_label(self.label());
        messages.resume(first_iteration).await;

        let dispatcher = JobDispatcher::new(
            Arc::clone(&self.instance),
            Arc::clone(&service),
            Arc::clone(&self.executor),
            policy_for_guard(&self.instance.runner_guard),
            Arc::clone(&self.job_runs),
            Arc::clone(&self.shutdown),
            self.timings.clone(),
        )
        .with_trace(self.trace);

        loop {
            let message = match messages.next_message(&listening).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    report.fatal = true;
                    break;
                }
            };

            let is_job = message.is_type(message_types::JOB_REQUEST);
            if is_job && self.shutdown.is_once() && dispatcher.has_accepted_job() {
                tracing::error!("Received a second job, but running in run once mode abort");
                report.fatal = true;
                break;
            }
            if !messages.delete_message(&message).await {
                continue;
            }
            if !is_job {
                tracing::info!("Ignoring incoming message of type: {}", message.message_type);
                continue;
            }
            let Some(cipher) = messages.cipher().cloned() else {
                continue;
            };

            let handle = match dispatcher.dispatch(&cipher, &message).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!("Failed to start job of message {}: {}", message.message_id, e);
                    continue;
                }
            };
            report.jobs += 1;
            let once = self.shutdown.is_once();
            if once {
                listening.cancel();
            }

            if self.supervise(&mut messages, handle).await {
                report.fatal = true;
            }
            // The service rejects reuse of an ephemeral session.
            if !self.shutdown.is_once() || self.instance.is_ephemeral() {
                messages.drop_session().await;
            }
            if once || self.shutdown.is_once() || report.fatal {
                break;
            }
        }

        messages.drop_session().await;
        report
    }

    /// Keep polling while the job runs so a cancellation request reaches
    /// it, then wait for it to finish. Returns `true` when the worker has
    /// to stop with a failure.
    async fn supervise(&self, messages: &mut MessageLoop, handle: JobHandle) -> bool {
        let done = handle.done();
        let mut fatal = false;
        loop {
            let message = match messages.next_message(&done).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    handle.cancel();
                    fatal = true;
                    break;
                }
            };
            if self.handle_during_job(messages, &handle, &message).await {
                if message.is_type(message_types::JOB_REQUEST) && self.shutdown.is_once() {
                    fatal = true;
                }
                tracing::info!("Wait for worker to finish current job");
                break;
            }
        }
        let result = handle.wait().await;
        tracing::debug!("Job finished with {}", result);
        fatal
    }

    /// React to a message received while a job runs. Returns `true` once
    /// polling should stop.
    async fn handle_during_job(&self, messages: &MessageLoop, handle: &JobHandle, message: &TaskAgentMessage) -> bool {
        if message.is_type(message_types::JOB_REQUEST) {
            if self.shutdown.is_once() {
                tracing::error!("Received a second job, but running in run once mode abort");
            } else {
                tracing::warn!(
                    "Skip deleting the duplicated job request, we hope that the actions service reschedules your job to a different runner"
                );
            }
            return true;
        }

        messages.delete_message(message).await;
        if message.is_type(message_types::JOB_CANCELLATION) {
            tracing::info!("JobCancellation request received, cancel running job {}", handle.request_id());
            handle.cancel();
            return true;
        }
        tracing::info!(
            "Received message, while still executing a job, of type: {}",
            message.message_type
        );
        false
    }

    /// Connection for this instance, fetching service discovery with
    /// backoff on first use. `None` when cancelled first.
    async fn connect(&self, cancel: &CancellationToken) -> Option<Arc<dyn RunnerService>> {
        let connected = self
            .service
            .get_or_try_init(|| async {
                let (agent, key) = self.instance.credentials().map_err(|_| ())?;
                let connection = VssConnection::new(self.instance.tenant_url(), self.http_timeout)
                    .with_credentials(agent.clone(), key.clone())
                    .with_pool(self.instance.pool_id)
                    .with_trace(self.trace);

                let mut backoff = Backoff::new(self.timings.backoff_initial, self.timings.backoff_max);
                loop {
                    match connection.fetch_connection_data().await {
                        Ok(_) => {
                            let service: Arc<dyn RunnerService> = Arc::new(connection);
                            return Ok(service);
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!(
                                "Failed to retrieve connectionData for {}, waiting {:?} before retry: {}",
                                self.label(),
                                delay,
                                e
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(()),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            })
            .await;
        connected.ok().cloned()
    }
}

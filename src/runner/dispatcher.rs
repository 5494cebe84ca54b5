//! From a `PipelineAgentJobRequest` message to a reported job result.
//!
//! 1. decrypt and decode the request
//! 2. write the crash-recovery marker
//! 3. admission check (a denied job is finished `Failed` right away)
//! 4. lock renewal in the background
//! 5. timeline on the job-scoped connection, executor behind a panic boundary
//! 6. final timeline, finish report with bounded retries, marker removal
//!
//! At most one job runs per dispatcher. In run-once mode a second job
//! request is refused even after the first one finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolTimings;
use crate::error::{DispatchError, ExecutorError};
use crate::protocol::agent::os_description;
use crate::protocol::job::{AgentJobRequestMessage, JobEvent, VariableValue};
use crate::protocol::service::RunnerService;
use crate::protocol::session::{SessionCipher, TaskAgentMessage};
use crate::protocol::timeline::TaskResult;
use crate::runner::admission::{Admission, JobAdmissionPolicy};
use crate::runner::backoff::retry_fixed;
use crate::runner::executor::{ExecutionContext, ExecutionRequest, JobExecutor, run_guarded, step_debug};
use crate::runner::job_run::{JobRunMarker, JobRunStore};
use crate::runner::masking::SecretMasker;
use crate::runner::settings::RunnerInstance;
use crate::runner::shutdown::{RunningJob, ShutdownController};
use crate::runner::timeline::{LogLevel, TimelineReporter};

pub struct JobDispatcher {
    instance: Arc<RunnerInstance>,
    service: Arc<dyn RunnerService>,
    executor: Arc<dyn JobExecutor>,
    policy: Arc<dyn JobAdmissionPolicy>,
    job_runs: Arc<JobRunStore>,
    shutdown: Arc<ShutdownController>,
    timings: ProtocolTimings,
    trace: bool,
    busy: Arc<AtomicBool>,
    accepted: AtomicBool,
}

impl JobDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: Arc<RunnerInstance>,
        service: Arc<dyn RunnerService>,
        executor: Arc<dyn JobExecutor>,
        policy: Arc<dyn JobAdmissionPolicy>,
        job_runs: Arc<JobRunStore>,
        shutdown: Arc<ShutdownController>,
        timings: ProtocolTimings,
    ) -> Self {
        Self {
            instance,
            service,
            executor,
            policy,
            job_runs,
            shutdown,
            timings,
            trace: false,
            busy: Arc::new(AtomicBool::new(false)),
            accepted: AtomicBool::new(false),
        }
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Whether a job request has been accepted since startup.
    pub fn has_accepted_job(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Accept a job request and start it in the background.
    pub async fn dispatch(&self, cipher: &SessionCipher, message: &TaskAgentMessage) -> Result<JobHandle, DispatchError> {
        if self.shutdown.is_once() && self.has_accepted_job() {
            return Err(DispatchError::SecondJobInRunOnce);
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::Busy);
        }

        let job = match self.decode(cipher, message) {
            Ok(job) => job,
            Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.accepted.store(true, Ordering::SeqCst);

        if let Err(e) = self.job_runs.record(JobRunMarker::new(&job, &self.instance)).await {
            tracing::info!("Failed to create jobrun.json: {}", e);
        }

        let cancel = self.shutdown.job_token();
        let done = CancellationToken::new();
        let finished = JobFinished {
            busy: Arc::clone(&self.busy),
            done: done.clone(),
            _running: self.shutdown.job_started(),
        };
        let request_id = job.request_id;
        let task = JobTask {
            job,
            instance: Arc::clone(&self.instance),
            service: Arc::clone(&self.service),
            executor: Arc::clone(&self.executor),
            policy: Arc::clone(&self.policy),
            job_runs: Arc::clone(&self.job_runs),
            timings: self.timings.clone(),
            cancel: cancel.clone(),
            report: self.shutdown.root().clone(),
        };
        let handle = tokio::spawn(async move {
            let _finished = finished;
            task.run().await
        });

        Ok(JobHandle {
            request_id,
            cancel,
            done,
            handle,
        })
    }

    fn decode(&self, cipher: &SessionCipher, message: &TaskAgentMessage) -> Result<AgentJobRequestMessage, DispatchError> {
        let payload = cipher.decrypt_message(message)?;
        if self.trace {
            tracing::debug!("Job request: {}", String::from_utf8_lossy(&payload));
        }
        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Clears the busy flag and signals completion however the job task ends.
struct JobFinished {
    busy: Arc<AtomicBool>,
    done: CancellationToken,
    _running: RunningJob,
}

impl Drop for JobFinished {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
        self.done.cancel();
    }
}

/// A job running in the background.
pub struct JobHandle {
    request_id: i64,
    cancel: CancellationToken,
    done: CancellationToken,
    handle: JoinHandle<TaskResult>,
}

impl JobHandle {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Cancel this job only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fires once the job is over, including its completion report.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub async fn wait(self) -> TaskResult {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Job task of request {} failed: {}", self.request_id, e);
                TaskResult::Failed
            }
        }
    }
}

struct JobTask {
    job: AgentJobRequestMessage,
    instance: Arc<RunnerInstance>,
    service: Arc<dyn RunnerService>,
    executor: Arc<dyn JobExecutor>,
    policy: Arc<dyn JobAdmissionPolicy>,
    job_runs: Arc<JobRunStore>,
    timings: ProtocolTimings,
    /// Cancels the job.
    cancel: CancellationToken,
    /// Cancels reporting (forced shutdown).
    report: CancellationToken,
}

impl JobTask {
    async fn run(self) -> TaskResult {
        tracing::info!(
            "Running Job '{}' of {} ( {} )",
            self.job.job_display_name,
            self.instance.name(),
            self.instance.registration_url
        );

        let github = self.job.context("github").unwrap_or_default();
        if let Admission::Deny(reason) = self.policy.evaluate(&github) {
            tracing::warn!("Job '{}' rejected: {}", self.job.job_display_name, reason);
            let service = Arc::clone(&self.service);
            self.finish(&service, TaskResult::Failed, None).await;
            return TaskResult::Failed;
        }

        let renewal_stop = CancellationToken::new();
        let renewal = tokio::spawn(renew_lock(
            Arc::clone(&self.service),
            self.job.request_id,
            self.timings.renew_interval,
            renewal_stop.clone(),
        ));

        let service = self.job_service().await;
        let (result, outputs) = self.execute(&service).await;
        self.finish(&service, result, outputs).await;

        renewal_stop.cancel();
        if let Err(e) = renewal.await {
            tracing::warn!("Lock renewal task failed: {}", e);
        }
        result
    }

    /// Connection for timeline, logs and the finish report. Falls back to
    /// the agent connection when the job carries no usable endpoint.
    async fn job_service(&self) -> Arc<dyn RunnerService> {
        let Some(endpoint) = self.job.system_connection() else {
            return Arc::clone(&self.service);
        };
        let token = endpoint.access_token().unwrap_or_default();
        match self.service.job_service(&endpoint.url, token).await {
            Ok(service) => service,
            Err(e) => {
                tracing::warn!("Failed to connect to {}, using the runner connection: {}", endpoint.url, e);
                Arc::clone(&self.service)
            }
        }
    }

    async fn execute(&self, service: &Arc<dyn RunnerService>) -> (TaskResult, Option<HashMap<String, VariableValue>>) {
        let debug = step_debug(&self.job);
        let (reporter, batcher) = TimelineReporter::start(
            Arc::clone(service),
            &self.job,
            SecretMasker::from_job(&self.job),
            debug,
            &self.timings,
        )
        .await;

        let request = match ExecutionRequest::from_job(&self.job) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Job '{}' is invalid: {}", self.job.job_display_name, e);
                let result = reporter.fail_init(&e.to_string(), &self.report).await;
                batcher.shutdown().await;
                return (result, None);
            }
        };

        reporter.add_steps(&request.step_records()).await;
        let log = reporter.job_log();
        log.info(&format!("Runner Name: {}", self.instance.name())).await;
        log.info(&format!("Runner OSDescription: {}", os_description())).await;
        log.info(&format!("Runner Version: {}", env!("CARGO_PKG_VERSION"))).await;

        let ctx = ExecutionContext {
            cancel: self.cancel.clone(),
            log,
        };
        let (result, outputs) = match run_guarded(self.executor.as_ref(), request, ctx).await {
            Ok(outcome) => {
                let result = if self.cancel.is_cancelled() {
                    TaskResult::Canceled
                } else {
                    outcome.result
                };
                let outputs = self.job.job_outputs.is_some().then(|| {
                    outcome
                        .outputs
                        .into_iter()
                        .map(|(k, v)| (k, VariableValue::new(v)))
                        .collect()
                });
                (reporter.finish(result, &self.report).await, outputs)
            }
            Err(e @ ExecutorError::Panicked { .. }) => {
                tracing::error!("{}", e);
                (reporter.fail_init(&e.to_string(), &self.report).await, None)
            }
            Err(e) => {
                reporter.log(LogLevel::Error, &e.to_string()).await;
                let result = if self.cancel.is_cancelled() {
                    TaskResult::Canceled
                } else {
                    TaskResult::Failed
                };
                (reporter.finish(result, &self.report).await, None)
            }
        };
        batcher.shutdown().await;
        (result, outputs)
    }

    /// Report the result. The marker is removed only once the service has
    /// accepted the report.
    async fn finish(
        &self,
        service: &Arc<dyn RunnerService>,
        result: TaskResult,
        outputs: Option<HashMap<String, VariableValue>>,
    ) {
        let mut event = JobEvent::completed(self.job.job_id.clone(), self.job.request_id, result);
        if let Some(outputs) = outputs {
            event = event.with_outputs(outputs);
        }
        let plan = self.job.plan();
        let finished = retry_fixed(
            self.timings.finish_attempts,
            self.timings.finish_interval,
            &self.report,
            &format!("finish Job '{}'", self.job.job_display_name),
            || service.finish_job(&plan, &event),
        )
        .await;

        match finished {
            Some(()) => {
                tracing::info!(
                    "Finished Job '{}' with Status {} of {} ( {} )",
                    self.job.job_display_name,
                    result,
                    self.instance.name(),
                    self.instance.registration_url
                );
                if let Err(e) = self.job_runs.clear(self.job.request_id).await {
                    tracing::warn!("Failed to delete jobrun.json: {}", e);
                }
            }
            None => tracing::error!(
                "Giving up reporting Job '{}', it stays recorded for the next start",
                self.job.job_display_name
            ),
        }
    }
}

/// Extend the job lock every `interval` until `stop` fires.
async fn renew_lock(
    service: Arc<dyn RunnerService>,
    request_id: i64,
    interval: std::time::Duration,
    stop: CancellationToken,
) {
    loop {
        if let Err(e) = service.renew_job(request_id).await {
            if stop.is_cancelled() {
                return;
            }
            tracing::warn!("Failed to renew job: {}", e);
        }
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

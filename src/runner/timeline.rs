//! Job timeline and step logs.
//!
//! The timeline is seeded with the job record and a `Setup Job` record.
//! Step records are appended once the step list is known. Every structural
//! change sends the full record list; only the final update is retried.
//!
//! Log lines are masked, prefixed by level, numbered per record and fed to
//! the [`LogBatcher`]. Each record's lines are also buffered and uploaded as
//! a log file when the record completes.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolTimings;
use crate::protocol::job::{AgentJobRequestMessage, TaskOrchestrationPlanReference};
use crate::protocol::service::RunnerService;
use crate::protocol::timeline::{
    TaskLogReference, TaskResult, TimelineRecord, TimelineRecordFeedLinesWrapper, TimelineRecordWrapper,
};
use crate::runner::backoff::retry_fixed;
use crate::runner::log_batcher::LogBatcher;
use crate::runner::masking::SecretMasker;

pub const SETUP_REF_NAME: &str = "__setup";
const JOB: usize = 0;
const SETUP: usize = 1;
const FIRST_STEP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Debug => "##[debug]",
            LogLevel::Info => "",
            LogLevel::Warning => "##[warning]",
            LogLevel::Error => "##[error]",
        }
    }
}

/// Split a message into console lines, each carrying the level prefix.
pub fn format_lines(level: LogLevel, message: &str) -> Vec<String> {
    let prefix = level.prefix();
    message
        .trim_matches(|c| c == '\r' || c == '\n')
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(|line| format!("{}{}", prefix, line))
        .collect()
}

/// Step as shown in the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub ref_name: String,
    pub display_name: String,
}

struct TimelineState {
    records: Vec<TimelineRecord>,
    /// Record receiving log lines.
    current: usize,
    next_line: i64,
    buffer: String,
}

pub struct TimelineReporter {
    service: Arc<dyn RunnerService>,
    plan: TaskOrchestrationPlanReference,
    timeline_id: String,
    masker: SecretMasker,
    debug: bool,
    timings: ProtocolTimings,
    lines: mpsc::Sender<TimelineRecordFeedLinesWrapper>,
    state: Mutex<TimelineState>,
}

impl TimelineReporter {
    /// Create the job and setup records, start both and publish them. The
    /// returned batcher has to be shut down once the job is over.
    pub async fn start(
        service: Arc<dyn RunnerService>,
        job: &AgentJobRequestMessage,
        masker: SecretMasker,
        debug: bool,
        timings: &ProtocolTimings,
    ) -> (Arc<Self>, LogBatcher) {
        let plan = job.plan();
        let timeline_id = job.timeline_id().to_string();
        let batcher = LogBatcher::spawn(
            Arc::clone(&service),
            plan.clone(),
            timeline_id.clone(),
            timings.log_window,
            timings.log_channel_capacity,
        );

        let mut job_record = TimelineRecord::new("", job.job_name.clone(), job.job_display_name.clone());
        job_record.id = job.job_id.clone();
        job_record.kind = "Job".to_string();
        job_record.order = 0;
        job_record.start();

        let mut setup = TimelineRecord::new(job.job_id.clone(), SETUP_REF_NAME, "Setup Job");
        setup.order = 1;
        setup.start();

        let reporter = Arc::new(Self {
            service,
            plan,
            timeline_id,
            masker,
            debug,
            timings: timings.clone(),
            lines: batcher.sender(),
            state: Mutex::new(TimelineState {
                records: vec![job_record, setup],
                current: SETUP,
                next_line: 1,
                buffer: String::new(),
            }),
        });
        {
            let state = reporter.state.lock().await;
            reporter.publish(&state.records).await;
        }
        (reporter, batcher)
    }

    /// Handle given to the executor.
    pub fn job_log(self: &Arc<Self>) -> JobLog {
        JobLog {
            reporter: Arc::clone(self),
        }
    }

    /// Append one pending record per step, ordered after setup.
    pub async fn add_steps(&self, steps: &[StepRecord]) {
        let mut state = self.state.lock().await;
        let job_id = state.records[JOB].id.clone();
        for (i, step) in steps.iter().enumerate() {
            let mut record = TimelineRecord::new(job_id.clone(), step.ref_name.clone(), step.display_name.clone());
            record.order = (FIRST_STEP + i) as i32;
            state.records.push(record);
        }
        self.publish(&state.records).await;
    }

    pub async fn log(&self, level: LogLevel, message: &str) {
        if level == LogLevel::Debug && !self.debug {
            return;
        }
        let masked = self.masker.mask(message);
        let lines = format_lines(level, &masked);

        let mut state = self.state.lock().await;
        for line in &lines {
            state.buffer.push_str(line);
            state.buffer.push('\n');
        }
        let record_id = state.records[state.current].id.clone();
        let start_line = state.next_line;
        state.next_line += lines.len() as i64;
        let chunk = TimelineRecordFeedLinesWrapper::new(record_id, start_line, lines);
        if self.lines.send(chunk).await.is_err() {
            tracing::debug!("Log upload already stopped, line kept in the step log only");
        }
    }

    /// Make step `index` the current record. The setup record is completed
    /// as `Succeeded` the first time a step starts.
    pub async fn start_step(&self, index: usize) {
        let mut state = self.state.lock().await;
        let position = FIRST_STEP + index;
        if position >= state.records.len() {
            tracing::warn!("Ignoring start of unknown step {}", index);
            return;
        }
        if state.current == SETUP && !state.records[SETUP].is_completed() {
            self.complete_current(&mut state, TaskResult::Succeeded).await;
        }
        state.current = position;
        state.next_line = 1;
        state.buffer.clear();
        state.records[position].start();
        self.publish(&state.records).await;
    }

    pub async fn complete_step(&self, index: usize, result: TaskResult) {
        let mut state = self.state.lock().await;
        let position = FIRST_STEP + index;
        if position >= state.records.len() || state.records[position].is_completed() {
            return;
        }
        if state.current == position {
            self.complete_current(&mut state, result).await;
        } else {
            state.records[position].complete(result);
        }
        self.publish(&state.records).await;
    }

    /// Fail the job outright. `message` is logged as an error to the current
    /// record (the setup record unless a step already started), which is
    /// completed as `Failed` together with the job.
    pub async fn fail_init(&self, message: &str, cancel: &CancellationToken) -> TaskResult {
        self.log(LogLevel::Error, message).await;
        let mut state = self.state.lock().await;
        if !state.records[state.current].is_completed() {
            self.complete_current(&mut state, TaskResult::Failed).await;
        }
        self.close(&mut state, TaskResult::Failed, cancel).await
    }

    /// Complete every open record and publish the final timeline. Returns
    /// the job result, which is `Failed` when the job never got past setup.
    pub async fn finish(&self, result: TaskResult, cancel: &CancellationToken) -> TaskResult {
        let mut state = self.state.lock().await;
        let mut result = result;
        if !state.records[state.current].is_completed() {
            let current_result = if result == TaskResult::Canceled {
                TaskResult::Canceled
            } else if state.current == SETUP {
                // Nothing ran.
                result = TaskResult::Failed;
                TaskResult::Failed
            } else {
                result
            };
            self.complete_current(&mut state, current_result).await;
        }
        self.close(&mut state, result, cancel).await
    }

    async fn close(&self, state: &mut TimelineState, result: TaskResult, cancel: &CancellationToken) -> TaskResult {
        for record in state.records.iter_mut().skip(SETUP) {
            if !record.is_completed() {
                record.complete(TaskResult::Skipped);
            }
        }
        state.records[JOB].complete(result);

        let wrapper = TimelineRecordWrapper::new(state.records.clone());
        let published = retry_fixed(
            self.timings.timeline_attempts,
            self.timings.timeline_interval,
            cancel,
            "upload the final timeline",
            || self.service.update_timeline(&self.plan, &self.timeline_id, &wrapper),
        )
        .await;
        if published.is_none() {
            tracing::warn!("Giving up on the final timeline of job {}", state.records[JOB].id);
        }
        result
    }

    /// Complete the current record and attach its buffered log.
    async fn complete_current(&self, state: &mut TimelineState, result: TaskResult) {
        let current = state.current;
        if !state.buffer.is_empty() {
            let content = std::mem::take(&mut state.buffer);
            match self
                .service
                .upload_log_file(&self.plan, &self.timeline_id, &content)
                .await
            {
                Ok(id) => {
                    state.records[current].log = Some(TaskLogReference { id, location: None });
                }
                Err(e) => tracing::warn!("Failed to upload log of {}: {}", state.records[current].name, e),
            }
        }
        state.records[current].complete(result);
        state.next_line = 1;
    }

    /// Best-effort timeline update.
    async fn publish(&self, records: &[TimelineRecord]) {
        let wrapper = TimelineRecordWrapper::new(records.to_vec());
        if let Err(e) = self
            .service
            .update_timeline(&self.plan, &self.timeline_id, &wrapper)
            .await
        {
            tracing::warn!("Failed to update timeline: {}", e);
        }
    }
}

/// Log sink and step hooks handed to a job executor.
#[derive(Clone)]
pub struct JobLog {
    reporter: Arc<TimelineReporter>,
}

impl JobLog {
    pub async fn log(&self, level: LogLevel, message: &str) {
        self.reporter.log(level, message).await;
    }

    pub async fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message).await;
    }

    pub async fn info(&self, message: &str) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message).await;
    }

    pub async fn error(&self, message: &str) {
        self.log(LogLevel::Error, message).await;
    }

    pub async fn start_step(&self, index: usize) {
        self.reporter.start_step(index).await;
    }

    pub async fn complete_step(&self, index: usize, result: TaskResult) {
        self.reporter.complete_step(index, result).await;
    }
}

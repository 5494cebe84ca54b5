//! Crash-recovery bookkeeping (`jobrun.json`).
//!
//! A marker is written before a job executes and removed once its
//! completion has been reported. A marker found at startup means the
//! previous process died mid-job; the job is then reported `Failed` so the
//! service does not wait for its own timeout.
//!
//! Several instances can run jobs at the same time, so the file holds a
//! list. Files written by older versions hold a single marker object.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolTimings;
use crate::error::SettingsError;
use crate::protocol::job::{AgentJobRequestMessage, JobEvent, TaskOrchestrationPlanReference};
use crate::protocol::service::RunnerService;
use crate::protocol::timeline::TaskResult;
use crate::runner::backoff::retry_fixed;
use crate::runner::settings::{RunnerInstance, read_json, remove_file, write_json};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRunMarker {
    pub request_id: i64,
    pub job_id: String,
    pub plan: Option<TaskOrchestrationPlanReference>,
    pub name: String,
    pub registration_url: String,
}

impl JobRunMarker {
    pub fn new(job: &AgentJobRequestMessage, instance: &RunnerInstance) -> Self {
        Self {
            request_id: job.request_id,
            job_id: job.job_id.clone(),
            plan: job.plan.clone(),
            name: instance.name().to_string(),
            registration_url: instance.registration_url.clone(),
        }
    }

    /// Whether this marker was left by `instance`. With a single configured
    /// instance every marker is attributed to it.
    pub fn belongs_to(&self, instance: &RunnerInstance, single_instance: bool) -> bool {
        single_instance || (self.registration_url == instance.registration_url && self.name == instance.name())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Stored {
    Many(Vec<JobRunMarker>),
    One(JobRunMarker),
}

/// Markers of every instance, persisted under one lock.
pub struct JobRunStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn markers(&self) -> Vec<JobRunMarker> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Persist `marker`, replacing one with the same request id.
    pub async fn record(&self, marker: JobRunMarker) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().await;
        let mut markers = self.read().await;
        markers.retain(|m| m.request_id != marker.request_id);
        markers.push(marker);
        self.write(&markers).await
    }

    /// Drop the marker of `request_id`. The file goes away with the last one.
    pub async fn clear(&self, request_id: i64) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().await;
        let mut markers = self.read().await;
        markers.retain(|m| m.request_id != request_id);
        self.write(&markers).await
    }

    async fn read(&self) -> Vec<JobRunMarker> {
        match read_json::<Stored>(&self.path).await {
            Ok(Some(Stored::Many(markers))) => markers,
            Ok(Some(Stored::One(marker))) => vec![marker],
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable jobrun.json: {}", e);
                Vec::new()
            }
        }
    }

    async fn write(&self, markers: &[JobRunMarker]) -> Result<(), SettingsError> {
        if markers.is_empty() {
            remove_file(&self.path).await
        } else {
            write_json(&self.path, &markers).await
        }
    }
}

/// Report every job `instance` left unfinished as `Failed`, then forget the
/// markers whatever the outcome. Returns how many jobs were reported.
pub async fn recover(
    store: &JobRunStore,
    instance: &RunnerInstance,
    single_instance: bool,
    service: &dyn RunnerService,
    timings: &ProtocolTimings,
    cancel: &CancellationToken,
) -> Result<usize, SettingsError> {
    let stale: Vec<JobRunMarker> = store
        .markers()
        .await
        .into_iter()
        .filter(|m| m.belongs_to(instance, single_instance))
        .collect();

    let mut reported = 0;
    for marker in stale {
        let event = JobEvent::completed(marker.job_id.clone(), marker.request_id, TaskResult::Failed);
        let plan = marker.plan.clone().unwrap_or_default();
        let finished = retry_fixed(
            timings.finish_attempts,
            timings.finish_interval,
            cancel,
            "finish previous stuck job",
            || service.finish_job(&plan, &event),
        )
        .await;
        match finished {
            Some(()) => {
                tracing::info!("Finished previous stuck job {} with Status Failed", marker.job_id);
                reported += 1;
            }
            None => tracing::warn!("Could not report previous stuck job {}", marker.job_id),
        }
        store.clear(marker.request_id).await?;
    }
    Ok(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::agent::TaskAgent;
    use crate::runner::testing::{Call, FakeService};
    use pretty_assertions::assert_eq;

    fn instance(name: &str, url: &str) -> RunnerInstance {
        let mut agent = TaskAgent::default();
        agent.name = name.to_string();
        RunnerInstance {
            registration_url: url.to_string(),
            agent: Some(agent),
            ..Default::default()
        }
    }

    fn marker(request_id: i64, name: &str) -> JobRunMarker {
        JobRunMarker {
            request_id,
            job_id: format!("job-{}", request_id),
            plan: Some(TaskOrchestrationPlanReference::default()),
            name: name.to_string(),
            registration_url: "https://github.com/octo".to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobrun.json");
        let store = JobRunStore::new(&path);

        store.record(marker(1, "a")).await.unwrap();
        store.record(marker(2, "b")).await.unwrap();
        assert_eq!(store.markers().await.len(), 2);

        store.clear(1).await.unwrap();
        assert_eq!(store.markers().await, vec![marker(2, "b")]);
        store.clear(2).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reads_single_legacy_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobrun.json");
        tokio::fs::write(
            &path,
            r#"{"RequestId": 9, "JobId": "j", "Plan": {"PlanId": "p"}, "Name": "a", "RegistrationUrl": "u"}"#,
        )
        .await
        .unwrap();

        let markers = JobRunStore::new(&path).markers().await;
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].request_id, 9);
        assert_eq!(markers[0].plan.as_ref().unwrap().plan_id, "p");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_reports_only_own_markers() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobRunStore::new(dir.path().join("jobrun.json"));
        store.record(marker(1, "a")).await.unwrap();
        store.record(marker(2, "b")).await.unwrap();

        let service = FakeService::new();
        service.fail_finish(2);
        let reported = recover(
            &store,
            &instance("a", "https://github.com/octo"),
            false,
            &service,
            &ProtocolTimings::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(reported, 1);
        let finished = service.finished();
        assert_eq!(finished.len(), 3);
        assert!(finished.iter().all(|e| e.job_id == "job-1" && e.result == TaskResult::Failed));
        assert_eq!(store.markers().await, vec![marker(2, "b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_single_instance_takes_all_and_clears_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobRunStore::new(dir.path().join("jobrun.json"));
        store.record(marker(7, "renamed")).await.unwrap();

        let service = FakeService::new();
        service.fail_finish(100);
        let reported = recover(
            &store,
            &instance("a", "elsewhere"),
            true,
            &service,
            &ProtocolTimings::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(reported, 0);
        assert_eq!(service.count(|c| matches!(c, Call::FinishJob(_))), 10);
        assert!(store.markers().await.is_empty());
    }
}

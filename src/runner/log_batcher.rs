//! Windowed upload of live console lines.
//!
//! Chunks arrive on a bounded channel. The first chunk after an idle period
//! opens a window; every chunk received until the window closes is merged
//! into the pending group of its step, and each group is uploaded once when
//! the window ends. Steps are uploaded in the order they first appeared in
//! the window, and lines of one step keep the order they were assigned.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::job::TaskOrchestrationPlanReference;
use crate::protocol::service::RunnerService;
use crate::protocol::timeline::TimelineRecordFeedLinesWrapper;

/// Handle to the consumer task.
pub struct LogBatcher {
    sender: mpsc::Sender<TimelineRecordFeedLinesWrapper>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LogBatcher {
    pub fn spawn(
        service: Arc<dyn RunnerService>,
        plan: TaskOrchestrationPlanReference,
        timeline_id: impl Into<String>,
        window: Duration,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let uploader = Uploader {
            service,
            plan,
            timeline_id: timeline_id.into(),
        };
        let handle = tokio::spawn(consume(receiver, uploader, window, cancel.clone()));
        Self {
            sender,
            cancel,
            handle,
        }
    }

    /// Sender for producers. Blocks when the channel is full.
    pub fn sender(&self) -> mpsc::Sender<TimelineRecordFeedLinesWrapper> {
        self.sender.clone()
    }

    /// Stop the consumer after flushing everything already queued.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.sender);
        if let Err(e) = self.handle.await {
            tracing::warn!("Log upload task failed: {}", e);
        }
    }
}

struct Uploader {
    service: Arc<dyn RunnerService>,
    plan: TaskOrchestrationPlanReference,
    timeline_id: String,
}

impl Uploader {
    async fn flush(&self, pending: &mut Vec<TimelineRecordFeedLinesWrapper>) {
        for batch in pending.drain(..) {
            if let Err(e) = self
                .service
                .append_timeline_lines(&self.plan, &self.timeline_id, &batch)
                .await
            {
                tracing::warn!("Failed to upload log lines for {}: {}", batch.step_id, e);
            }
        }
    }
}

/// Add `chunk` to the group of its step, opening a new group after the
/// existing ones when the step has none yet. Groups are uploaded in that
/// order when the window closes.
fn merge(pending: &mut Vec<TimelineRecordFeedLinesWrapper>, chunk: TimelineRecordFeedLinesWrapper) {
    match pending.iter_mut().find(|p| p.step_id == chunk.step_id) {
        Some(group) => group.extend(chunk),
        None => pending.push(chunk),
    }
}

async fn consume(
    mut receiver: mpsc::Receiver<TimelineRecordFeedLinesWrapper>,
    uploader: Uploader,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut pending: Vec<TimelineRecordFeedLinesWrapper> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let at = deadline;
        let window_closed = async move {
            match at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            chunk = receiver.recv() => match chunk {
                Some(chunk) => {
                    // A chunk for another step joins the open window as its
                    // own group; the window is not flushed or restarted.
                    merge(&mut pending, chunk);
                    deadline.get_or_insert_with(|| Instant::now() + window);
                }
                None => break,
            },
            _ = window_closed => {
                uploader.flush(&mut pending).await;
                deadline = None;
            }
            _ = cancel.cancelled() => {
                while let Ok(chunk) = receiver.try_recv() {
                    merge(&mut pending, chunk);
                }
                break;
            }
        }
    }

    uploader.flush(&mut pending).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::FakeService;
    use pretty_assertions::assert_eq;

    fn chunk(step: &str, start: i64, lines: &[&str]) -> TimelineRecordFeedLinesWrapper {
        TimelineRecordFeedLinesWrapper::new(step, start, lines.iter().map(|l| l.to_string()).collect())
    }

    fn batcher(service: &FakeService) -> LogBatcher {
        LogBatcher::spawn(
            Arc::new(service.clone()),
            TaskOrchestrationPlanReference::default(),
            "timeline",
            Duration::from_secs(1),
            64,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_per_step_within_window() {
        let service = FakeService::new();
        let batcher = batcher(&service);
        let tx = batcher.sender();

        tx.send(chunk("A", 1, &["1", "2"])).await.unwrap();
        tx.send(chunk("B", 1, &["1"])).await.unwrap();
        tx.send(chunk("A", 3, &["3"])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let uploads = service.appended();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].step_id, "A");
        assert_eq!(uploads[0].value, vec!["1", "2", "3"]);
        assert_eq!(uploads[0].start_line, Some(1));
        assert_eq!(uploads[0].count, 3);
        assert_eq!(uploads[1].step_id, "B");
        assert_eq!(uploads[1].value, vec!["1"]);

        batcher.shutdown().await;
        assert_eq!(service.appended().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_change_keeps_the_window() {
        let service = FakeService::new();
        let batcher = batcher(&service);
        let tx = batcher.sender();

        tx.send(chunk("A", 1, &["1"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(chunk("B", 1, &["1"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.appended().is_empty());

        // Both groups go out when the window opened by A closes.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let steps: Vec<String> = service.appended().into_iter().map(|u| u.step_id).collect();
        assert_eq!(steps, vec!["A", "B"]);
        batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_upload_separately() {
        let service = FakeService::new();
        let batcher = batcher(&service);
        let tx = batcher.sender();

        tx.send(chunk("A", 1, &["1"])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(chunk("A", 2, &["2"])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let uploads = service.appended();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[1].start_line, Some(2));
        batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending() {
        let service = FakeService::new();
        let batcher = batcher(&service);
        let tx = batcher.sender();

        tx.send(chunk("A", 1, &["1"])).await.unwrap();
        tx.send(chunk("A", 2, &["2"])).await.unwrap();
        drop(tx);
        batcher.shutdown().await;

        let uploads = service.appended();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].value, vec!["1", "2"]);
    }
}

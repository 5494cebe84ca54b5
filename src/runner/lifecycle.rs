//! Process lifecycle: migrate legacy state, load settings, run one worker
//! per configured instance and decide the exit code.
//!
//! Exit codes: `0` after a clean shutdown or a finished run-once job, `1`
//! when the configuration is missing or corrupt or a worker failed fatally.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::AgentConfig;
use crate::protocol::service::RunnerService;
use crate::runner::executor::JobExecutor;
use crate::runner::job_run::JobRunStore;
use crate::runner::migrate::migrate;
use crate::runner::settings::{RunnerSettings, remove_file};
use crate::runner::shutdown::ShutdownController;
use crate::runner::state::AgentState;
use crate::runner::worker::Worker;

pub struct LifecycleController {
    config: AgentConfig,
    executor: Arc<dyn JobExecutor>,
    shutdown: Arc<ShutdownController>,
    service: Option<Arc<dyn RunnerService>>,
}

impl LifecycleController {
    pub fn new(config: AgentConfig, executor: Arc<dyn JobExecutor>, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            config,
            executor,
            shutdown,
            service: None,
        }
    }

    /// Talk to `service` for every instance instead of connecting to each
    /// instance's tenant.
    pub fn with_service(mut self, service: Arc<dyn RunnerService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Run until shutdown. Returns the process exit code.
    pub async fn run(self) -> i32 {
        let paths = self.config.paths();
        match migrate(&paths).await {
            Ok(report) if report.session || report.instance => {
                tracing::info!("Migrated legacy state files in {}", self.config.dir.display());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Failed to migrate legacy state: {}", e);
                return 1;
            }
        }

        let settings = match RunnerSettings::load(&paths.settings).await {
            Ok(settings) if !settings.instances.is_empty() => settings,
            Ok(_) => {
                tracing::error!("settings.json is missing or empty, please configure the runner first");
                return 1;
            }
            Err(e) => {
                tracing::error!("Failed to load settings: {}", e);
                return 1;
            }
        };

        let ephemeral = settings.is_ephemeral();
        if ephemeral {
            self.shutdown.force_once();
        }

        let state = Arc::new(AgentState::load(&paths.sessions).await);
        let job_runs = Arc::new(JobRunStore::new(&paths.job_run));
        let single_instance = settings.instances.len() == 1;
        let workers: Vec<Arc<Worker>> = settings
            .instances
            .into_iter()
            .map(|instance| {
                let worker = Worker::new(
                    instance,
                    Arc::clone(&state),
                    Arc::clone(&job_runs),
                    Arc::clone(&self.executor),
                    Arc::clone(&self.shutdown),
                )
                .with_single_instance(single_instance)
                .with_timings(self.config.timings.clone())
                .with_http_timeout(self.config.http_timeout)
                .with_trace(self.config.trace);
                match &self.service {
                    Some(service) => Arc::new(worker.with_service(Arc::clone(service))),
                    None => Arc::new(worker),
                }
            })
            .collect();

        let mut first_iteration = true;
        loop {
            let listening = self.shutdown.listening_token();
            let mut tasks = JoinSet::new();
            for worker in &workers {
                let worker = Arc::clone(worker);
                let listening = listening.clone();
                tasks.spawn(async move {
                    let report = worker.run(first_iteration, listening).await;
                    (worker.instance().name().to_string(), report)
                });
            }

            let mut fatal = false;
            let mut jobs = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, report)) => {
                        if report.fatal {
                            tracing::error!("Worker {} stopped with a fatal error", name);
                        }
                        fatal |= report.fatal;
                        jobs += report.jobs;
                    }
                    Err(e) => {
                        tracing::error!("Worker task failed: {}", e);
                        fatal = true;
                    }
                }
            }
            first_iteration = false;

            if ephemeral && jobs > 0 {
                for path in [&paths.settings, &paths.sessions] {
                    if let Err(e) = remove_file(path).await {
                        tracing::warn!("Failed to remove {}: {}", path.display(), e);
                    }
                }
            }
            if fatal {
                return 1;
            }
            if self.shutdown.root().is_cancelled()
                || self.shutdown.is_draining()
                || (self.shutdown.is_once() && jobs > 0)
            {
                return 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use crate::protocol::agent::tests::test_key;
    use crate::protocol::timeline::TaskResult;
    use crate::runner::dispatcher::tests::{ScriptedExecutor, instance, job_message};
    use crate::runner::settings::RunnerInstance;
    use crate::runner::testing::{Call, FakeService};
    use std::time::Duration;

    fn configured(ephemeral: bool) -> RunnerInstance {
        let mut instance = instance();
        if let Some(agent) = instance.agent.as_mut() {
            agent.ephemeral = ephemeral;
        }
        instance.set_private_key(test_key()).unwrap();
        instance
    }

    async fn write_settings(dir: &std::path::Path, instances: Vec<RunnerInstance>) {
        let settings = RunnerSettings {
            instances,
            ..Default::default()
        };
        settings.save(&dir.join("settings.json")).await.unwrap();
    }

    fn build(dir: &std::path::Path, once: bool, service: &FakeService) -> (LifecycleController, Arc<ShutdownController>) {
        build_with(dir, once, service, ScriptedExecutor::new(TaskResult::Succeeded))
    }

    fn build_with(
        dir: &std::path::Path,
        once: bool,
        service: &FakeService,
        executor: ScriptedExecutor,
    ) -> (LifecycleController, Arc<ShutdownController>) {
        let shutdown = ShutdownController::new(once);
        let config = AgentConfig::default().with_dir(dir).with_once(once);
        let controller = LifecycleController::new(config, Arc::new(executor), Arc::clone(&shutdown))
            .with_service(Arc::new(service.clone()));
        (controller, shutdown)
    }

    /// Deliver an interrupt after `after`.
    fn interrupt_after(shutdown: &Arc<ShutdownController>, after: Duration) {
        let shutdown = Arc::clone(shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            shutdown.on_interrupt();
        });
    }

    #[tokio::test]
    async fn test_missing_or_broken_settings_exit_1() {
        let dir = tempfile::tempdir().unwrap();
        let service = FakeService::new();

        let (controller, _) = build(dir.path(), false, &service);
        assert_eq!(controller.run().await, 1);

        tokio::fs::write(dir.path().join("settings.json"), "{ not json").await.unwrap();
        let (controller, _) = build(dir.path(), false, &service);
        assert_eq!(controller.run().await, 1);

        write_settings(dir.path(), Vec::new()).await;
        let (controller, _) = build(dir.path(), false, &service);
        assert_eq!(controller.run().await, 1);
        assert!(service.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_exits_after_job() {
        let dir = tempfile::tempdir().unwrap();
        write_settings(dir.path(), vec![configured(false)]).await;
        let service = FakeService::new();
        service.push_message(Ok(Some(job_message(1, 42))));

        let (controller, _) = build(dir.path(), true, &service);
        assert_eq!(controller.run().await, 0);

        assert_eq!(service.finished().len(), 1);
        assert!(dir.path().join("settings.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_forces_once_and_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        write_settings(dir.path(), vec![configured(true)]).await;
        let service = FakeService::new();
        service.push_message(Ok(Some(job_message(1, 42))));

        let (controller, _) = build(dir.path(), false, &service);
        assert_eq!(controller.run().await, 0);

        assert_eq!(service.finished()[0].result, TaskResult::Succeeded);
        assert!(!dir.path().join("settings.json").exists());
        assert!(!dir.path().join("sessions.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_worker_exits_1() {
        let dir = tempfile::tempdir().unwrap();
        write_settings(dir.path(), vec![configured(false)]).await;
        let service = FakeService::new();
        service.push_session(Err(ConnectionError::Authorization {
            reason: "TaskAgentNotFoundException".to_string(),
        }));

        let (controller, _) = build(dir.path(), false, &service);
        assert_eq!(controller.run().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_without_job_exits_0() {
        let dir = tempfile::tempdir().unwrap();
        write_settings(dir.path(), vec![configured(false)]).await;
        let service = FakeService::new();

        let (controller, shutdown) = build(dir.path(), false, &service);
        let trigger = Arc::clone(&shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.on_interrupt();
        });

        assert_eq!(controller.run().await, 0);
        assert_eq!(service.count(|c| *c == Call::CreateSession), 1);
        assert!(service.calls().contains(&Call::DeleteSession("session-0".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_job_lets_it_finish() {
        let dir = tempfile::tempdir().unwrap();
        write_settings(dir.path(), vec![configured(false)]).await;
        let service = FakeService::new();
        service.push_message(Ok(Some(job_message(1, 42))));

        let executor = ScriptedExecutor {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedExecutor::new(TaskResult::Succeeded)
        };
        let (controller, shutdown) = build_with(dir.path(), false, &service, executor);
        interrupt_after(&shutdown, Duration::from_secs(5));

        assert_eq!(controller.run().await, 0);
        assert!(shutdown.is_draining());
        assert!(!shutdown.root().is_cancelled());

        let finished = service.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].result, TaskResult::Succeeded);
        assert_eq!(service.count(|c| *c == Call::CreateSession), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_interrupt_cancels_running_job() {
        let dir = tempfile::tempdir().unwrap();
        write_settings(dir.path(), vec![configured(false)]).await;
        let service = FakeService::new();
        service.push_message(Ok(Some(job_message(1, 42))));

        let (controller, shutdown) = build_with(dir.path(), false, &service, ScriptedExecutor::blocking());
        interrupt_after(&shutdown, Duration::from_secs(5));
        interrupt_after(&shutdown, Duration::from_secs(10));

        assert_eq!(controller.run().await, 0);
        assert!(shutdown.root().is_cancelled());

        let finished = service.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].result, TaskResult::Canceled);
    }
}

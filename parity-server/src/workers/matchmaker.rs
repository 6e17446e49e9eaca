use crate::{
    repositories::runner::{RunnerRepository, RunnerStatus},
    services::task::{TaskService, TaskServiceError},
    workers::{events::EventBus, webhook::AssignmentNotifier},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info};

pub struct MatchmakerArgs {
    pub service: Arc<dyn TaskService>,
    pub runners: Arc<dyn RunnerRepository>,
    pub notifier: Arc<dyn AssignmentNotifier>,
    pub events: EventBus,
    pub tick_interval: Duration,
}

/// Pairs pending tasks with online runners. Runs on a short tick and also
/// reacts to task/runner events; assignment races are arbitrated by the
/// Pending guard on the task row, so losing a sweep is harmless.
pub struct Matchmaker {
    service: Arc<dyn TaskService>,
    runners: Arc<dyn RunnerRepository>,
    notifier: Arc<dyn AssignmentNotifier>,
    events: EventBus,
    tick_interval: Duration,
}

impl Matchmaker {
    pub fn spawn(args: MatchmakerArgs, shutdown: broadcast::Receiver<()>) {
        let MatchmakerArgs { service, runners, notifier, events, tick_interval } = args;
        let matchmaker = Self { service, runners, notifier, events, tick_interval };
        tokio::spawn(matchmaker.run(shutdown));
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.events.subscribe();
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down matchmaker");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                event = events.recv() => {
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            error!("Event bus closed, exiting matchmaker");
                            break;
                        }
                    }
                    while events.try_recv().is_ok() {}
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let tasks = match self.service.list_available().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list available tasks: {e}");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }
        let runners = match self.runners.list_by_status(RunnerStatus::Online).await {
            Ok(runners) => runners,
            Err(e) => {
                error!("Failed to list online runners: {e}");
                return;
            }
        };
        if runners.is_empty() {
            debug!("{} tasks pending but no runner online", tasks.len());
            return;
        }

        let mut cursor = 0;
        for task in tasks {
            let mut attempts = 0;
            while attempts < runners.len() {
                let candidate = &runners[cursor % runners.len()];
                cursor += 1;
                attempts += 1;

                // The listing can be stale by the time we get here.
                let runner = match self.runners.find(&candidate.device_id).await {
                    Ok(runner) if runner.status == RunnerStatus::Online => runner,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Skipping runner {}: {e}", candidate.device_id);
                        continue;
                    }
                };
                match self.service.assign(task.id, &runner.device_id).await {
                    Ok(()) => {
                        self.notifier.notify_assignment(task.id, runner.device_id).await;
                        break;
                    }
                    Err(TaskServiceError::TaskUnavailable) => {
                        // Someone else claimed the task; move on to the next.
                        debug!("Task {} no longer available", task.id);
                        break;
                    }
                    Err(e) => {
                        debug!("Could not assign task {} to {}: {e}", task.id, runner.device_id);
                        continue;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        repositories::{
            runner::{MockRunnerRepository, RunnerModel},
            task::{TaskModel, TaskStatus, TaskType},
        },
        services::task::MockTaskService,
        workers::webhook::MockAssignmentNotifier,
    };
    use chrono::Utc;
    use mockall::predicate::eq;
    use parity_server_models::tasks::TaskConfig;
    use uuid::Uuid;

    fn make_task() -> TaskModel {
        let now = Utc::now();
        TaskModel {
            id: Uuid::new_v4(),
            title: "task".into(),
            description: String::new(),
            task_type: TaskType::Command,
            config: TaskConfig { command: vec!["echo".into()], ..Default::default() },
            environment: None,
            creator_device_id: "creator-1".into(),
            creator_address: String::new(),
            nonce: "ab".repeat(32),
            status: TaskStatus::Pending,
            reward: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn make_runner(device_id: &str, status: RunnerStatus) -> RunnerModel {
        let now = Utc::now();
        RunnerModel {
            device_id: device_id.into(),
            wallet_address: String::new(),
            webhook: "http://10.0.0.1:8080".into(),
            status,
            task_id: None,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    struct Builder {
        service: MockTaskService,
        runners: MockRunnerRepository,
        notifier: MockAssignmentNotifier,
    }

    impl Default for Builder {
        fn default() -> Self {
            Self { service: Default::default(), runners: Default::default(), notifier: Default::default() }
        }
    }

    impl Builder {
        fn build(self) -> Matchmaker {
            Matchmaker {
                service: Arc::new(self.service),
                runners: Arc::new(self.runners),
                notifier: Arc::new(self.notifier),
                events: EventBus::new(),
                tick_interval: Duration::from_secs(5),
            }
        }
    }

    #[tokio::test]
    async fn round_robin_pairing() {
        let first = make_task();
        let second = make_task();
        let (first_id, second_id) = (first.id, second.id);
        let mut builder = Builder::default();
        builder.service.expect_list_available().return_once(move || Ok(vec![first, second]));
        builder
            .runners
            .expect_list_by_status()
            .with(eq(RunnerStatus::Online))
            .return_once(|_| Ok(vec![make_runner("runner-1", RunnerStatus::Online), make_runner("runner-2", RunnerStatus::Online)]));
        builder.runners.expect_find().returning(|id| Ok(make_runner(id, RunnerStatus::Online)));
        builder
            .service
            .expect_assign()
            .withf(move |id, device| *id == first_id && device == "runner-1")
            .once()
            .return_once(|_, _| Ok(()));
        builder
            .service
            .expect_assign()
            .withf(move |id, device| *id == second_id && device == "runner-2")
            .once()
            .return_once(|_, _| Ok(()));
        builder.notifier.expect_notify_assignment().with(eq(first_id), eq("runner-1".to_string())).once().return_once(|_, _| ());
        builder.notifier.expect_notify_assignment().with(eq(second_id), eq("runner-2".to_string())).once().return_once(|_, _| ());

        builder.build().sweep().await;
    }

    #[tokio::test]
    async fn lost_race_moves_to_next_task() {
        let first = make_task();
        let second = make_task();
        let (first_id, second_id) = (first.id, second.id);
        let mut builder = Builder::default();
        builder.service.expect_list_available().return_once(move || Ok(vec![first, second]));
        builder
            .runners
            .expect_list_by_status()
            .return_once(|_| Ok(vec![make_runner("runner-1", RunnerStatus::Online)]));
        builder.runners.expect_find().returning(|id| Ok(make_runner(id, RunnerStatus::Online)));
        builder
            .service
            .expect_assign()
            .withf(move |id, _| *id == first_id)
            .once()
            .return_once(|_, _| Err(TaskServiceError::TaskUnavailable));
        builder
            .service
            .expect_assign()
            .withf(move |id, device| *id == second_id && device == "runner-1")
            .once()
            .return_once(|_, _| Ok(()));
        builder
            .notifier
            .expect_notify_assignment()
            .with(eq(second_id), eq("runner-1".to_string()))
            .once()
            .return_once(|_, _| ());

        builder.build().sweep().await;
    }

    #[tokio::test]
    async fn runner_gone_offline_between_list_and_assign() {
        let task = make_task();
        let task_id = task.id;
        let mut builder = Builder::default();
        builder.service.expect_list_available().return_once(move || Ok(vec![task]));
        builder
            .runners
            .expect_list_by_status()
            .return_once(|_| Ok(vec![make_runner("runner-1", RunnerStatus::Online), make_runner("runner-2", RunnerStatus::Online)]));
        builder
            .runners
            .expect_find()
            .withf(|id| id == "runner-1")
            .return_once(|id| Ok(make_runner(id, RunnerStatus::Offline)));
        builder
            .runners
            .expect_find()
            .withf(|id| id == "runner-2")
            .return_once(|id| Ok(make_runner(id, RunnerStatus::Online)));
        builder
            .service
            .expect_assign()
            .withf(move |id, device| *id == task_id && device == "runner-2")
            .once()
            .return_once(|_, _| Ok(()));
        builder
            .notifier
            .expect_notify_assignment()
            .with(eq(task_id), eq("runner-2".to_string()))
            .once()
            .return_once(|_, _| ());

        builder.build().sweep().await;
    }

    #[tokio::test]
    async fn no_runners_online() {
        let task = make_task();
        let mut builder = Builder::default();
        builder.service.expect_list_available().return_once(move || Ok(vec![task]));
        builder.runners.expect_list_by_status().return_once(|_| Ok(vec![]));

        builder.build().sweep().await;
    }
}

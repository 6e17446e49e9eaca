use crate::{
    repositories::{
        runner::{RunnerModel, RunnerRepository, RunnerStatus},
        task::{TaskRepository, TaskStatus, TaskTransition},
    },
    workers::events::{EventBus, TaskEvent},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

pub struct HeartbeatMonitorArgs {
    pub runners: Arc<dyn RunnerRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub events: EventBus,
    pub check_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Periodically sweeps the runner directory, marks silent runners offline and
/// puts the tasks they held back on the pending queue.
pub struct HeartbeatMonitor {
    runners: Arc<dyn RunnerRepository>,
    tasks: Arc<dyn TaskRepository>,
    events: EventBus,
    check_interval: Duration,
    heartbeat_timeout: chrono::Duration,
}

impl HeartbeatMonitor {
    pub fn spawn(args: HeartbeatMonitorArgs, shutdown: broadcast::Receiver<()>) {
        let HeartbeatMonitorArgs { runners, tasks, events, check_interval, heartbeat_timeout } = args;
        let heartbeat_timeout =
            chrono::Duration::from_std(heartbeat_timeout).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let monitor = Self { runners, tasks, events, check_interval, heartbeat_timeout };
        tokio::spawn(monitor.run(shutdown));
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down heartbeat monitor");
                    break;
                }
                _ = ticker.tick() => {
                    self.scan().await;
                }
            }
        }
    }

    async fn scan(&self) {
        let now = Utc::now();
        for status in [RunnerStatus::Online, RunnerStatus::Busy] {
            let runners = match self.runners.list_by_status(status).await {
                Ok(runners) => runners,
                Err(e) => {
                    error!("Failed to list {status} runners: {e}");
                    continue;
                }
            };
            for runner in runners {
                if now - runner.last_heartbeat > self.heartbeat_timeout {
                    self.expire(runner).await;
                }
            }
        }
    }

    async fn expire(&self, mut runner: RunnerModel) {
        warn!(
            "Runner {} last seen at {}, marking offline",
            runner.device_id, runner.last_heartbeat
        );
        let held_task = runner.task_id.take();
        runner.status = RunnerStatus::Offline;
        runner.updated_at = Utc::now();
        let device_id = runner.device_id.clone();
        if let Err(e) = self.runners.update(runner).await {
            error!("Failed to mark runner {device_id} offline: {e}");
            return;
        }
        let Some(task_id) = held_task else { return };
        match self.tasks.transition(TaskTransition::new(task_id, TaskStatus::Running, TaskStatus::Pending)).await {
            Ok(true) => {
                info!("Released task {task_id} held by dead runner {device_id}");
                self.events.publish(TaskEvent::TaskReleased(task_id));
            }
            Ok(false) => debug!("Task {task_id} held by {device_id} already moved on"),
            Err(e) => error!("Failed to release task {task_id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{runner::MockRunnerRepository, task::MockTaskRepository};
    use mockall::predicate::eq;
    use uuid::Uuid;

    fn make_runner(device_id: &str, status: RunnerStatus, last_heartbeat: chrono::DateTime<Utc>) -> RunnerModel {
        let now = Utc::now();
        RunnerModel {
            device_id: device_id.into(),
            wallet_address: String::new(),
            webhook: String::new(),
            status,
            task_id: None,
            last_heartbeat,
            created_at: now,
            updated_at: now,
        }
    }

    fn make_monitor(runners: MockRunnerRepository, tasks: MockTaskRepository) -> (HeartbeatMonitor, EventBus) {
        let events = EventBus::new();
        let monitor = HeartbeatMonitor {
            runners: Arc::new(runners),
            tasks: Arc::new(tasks),
            events: events.clone(),
            check_interval: Duration::from_secs(60),
            heartbeat_timeout: chrono::Duration::minutes(5),
        };
        (monitor, events)
    }

    #[tokio::test]
    async fn stale_busy_runner_releases_its_task() {
        let task_id = Uuid::new_v4();
        let stale = Utc::now() - chrono::Duration::minutes(10);
        let mut dead = make_runner("runner-1", RunnerStatus::Busy, stale);
        dead.task_id = Some(task_id);

        let mut runners = MockRunnerRepository::default();
        runners.expect_list_by_status().with(eq(RunnerStatus::Online)).return_once(|_| Ok(vec![]));
        runners.expect_list_by_status().with(eq(RunnerStatus::Busy)).return_once(move |_| Ok(vec![dead]));
        runners
            .expect_update()
            .withf(|runner| runner.status == RunnerStatus::Offline && runner.task_id.is_none())
            .once()
            .return_once(|_| Ok(()));
        let mut tasks = MockTaskRepository::default();
        tasks
            .expect_transition()
            .with(eq(TaskTransition::new(task_id, TaskStatus::Running, TaskStatus::Pending)))
            .once()
            .return_once(|_| Ok(true));

        let (monitor, events) = make_monitor(runners, tasks);
        let mut events = events.subscribe();
        monitor.scan().await;
        assert_eq!(events.try_recv().unwrap(), TaskEvent::TaskReleased(task_id));
    }

    #[tokio::test]
    async fn fresh_runners_are_left_alone() {
        let fresh = make_runner("runner-1", RunnerStatus::Online, Utc::now());
        let mut runners = MockRunnerRepository::default();
        runners.expect_list_by_status().with(eq(RunnerStatus::Online)).return_once(move |_| Ok(vec![fresh]));
        runners.expect_list_by_status().with(eq(RunnerStatus::Busy)).return_once(|_| Ok(vec![]));

        // No update expectation: touching the runner would panic.
        let (monitor, _events) = make_monitor(runners, MockTaskRepository::default());
        monitor.scan().await;
    }

    #[tokio::test]
    async fn stale_idle_runner_goes_offline_without_release() {
        let stale = Utc::now() - chrono::Duration::minutes(10);
        let dead = make_runner("runner-1", RunnerStatus::Online, stale);
        let mut runners = MockRunnerRepository::default();
        runners.expect_list_by_status().with(eq(RunnerStatus::Online)).return_once(move |_| Ok(vec![dead]));
        runners.expect_list_by_status().with(eq(RunnerStatus::Busy)).return_once(|_| Ok(vec![]));
        runners
            .expect_update()
            .withf(|runner| runner.status == RunnerStatus::Offline)
            .once()
            .return_once(|_| Ok(()));

        let (monitor, _events) = make_monitor(runners, MockTaskRepository::default());
        monitor.scan().await;
    }
}

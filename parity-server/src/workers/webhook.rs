use crate::{
    clients::webhook::{WebhookClient, WebhookTarget},
    repositories::{
        runner::RunnerRepository,
        task::{TaskModel, TaskRepository, TaskStatus},
    },
    services::task::TaskService,
    workers::events::TaskEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parity_server_models::webhooks::WebhookMessage;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHANNEL_SIZE: usize = 1024;

/// Backoff after each failed delivery attempt of an assignment notification.
/// The first attempt goes out immediately; the last backoff runs before the
/// pessimistic failure check.
const NOTIFY_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

/// A runner-facing push endpoint registered over the API.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookRegistration {
    pub id: Uuid,
    pub url: String,
    pub device_id: String,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
}

/// In-process webhook directory, one registration per device. Writers take
/// the lock exclusively; the fan-out takes a snapshot and never holds the
/// lock across I/O.
#[derive(Default)]
pub struct WebhookRegistry {
    inner: RwLock<HashMap<String, WebhookRegistration>>,
}

impl WebhookRegistry {
    pub fn register(&self, device_id: &str, url: &str, wallet_address: &str) -> Uuid {
        let registration = WebhookRegistration {
            id: Uuid::new_v4(),
            url: url.into(),
            device_id: device_id.into(),
            wallet_address: wallet_address.into(),
            created_at: Utc::now(),
        };
        let id = registration.id;
        self.inner.write().expect("lock poisoned").insert(device_id.into(), registration);
        id
    }

    pub fn remove(&self, device_id: &str) -> Option<WebhookRegistration> {
        self.inner.write().expect("lock poisoned").remove(device_id)
    }

    pub fn snapshot(&self) -> Vec<WebhookRegistration> {
        self.inner.read().expect("lock poisoned").values().cloned().collect()
    }
}

pub struct WebhookFanoutArgs {
    pub registry: Arc<WebhookRegistry>,
    pub tasks: Arc<dyn TaskRepository>,
    pub client: Arc<dyn WebhookClient>,
    pub max_in_flight: usize,
}

/// Pushes the current set of pending tasks to every registered webhook when a
/// task update pulse arrives. Pulses are coalesced into at most one
/// outstanding sweep; failures are logged and left to runner polling.
pub struct WebhookFanout {
    registry: Arc<WebhookRegistry>,
    tasks: Arc<dyn TaskRepository>,
    client: Arc<dyn WebhookClient>,
    max_in_flight: usize,
}

impl WebhookFanout {
    pub fn spawn(
        args: WebhookFanoutArgs,
        events: broadcast::Receiver<TaskEvent>,
        shutdown: broadcast::Receiver<()>,
    ) {
        let WebhookFanoutArgs { registry, tasks, client, max_in_flight } = args;
        let fanout = Self { registry, tasks, client, max_in_flight };
        tokio::spawn(fanout.run(events, shutdown));
    }

    async fn run(self, mut events: broadcast::Receiver<TaskEvent>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down webhook fan-out");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Event bus closed, exiting fan-out");
                            break;
                        }
                    }
                    // Coalesce whatever queued up behind this pulse.
                    while events.try_recv().is_ok() {}
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let tasks = match self.tasks.list_by_status(TaskStatus::Pending).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list pending tasks for fan-out: {e}");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }
        let webhooks = self.registry.snapshot();
        if webhooks.is_empty() {
            return;
        }
        debug!("Fanning {} pending tasks out to {} webhooks", tasks.len(), webhooks.len());
        let payload: Vec<parity_server_models::tasks::Task> = tasks.into_iter().map(Into::into).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut handles = Vec::with_capacity(webhooks.len());
        for webhook in webhooks {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let client = self.client.clone();
            let message = WebhookMessage::available_tasks(payload.clone());
            handles.push(tokio::spawn(async move {
                let target = WebhookTarget { url: webhook.url.clone(), webhook_id: Some(webhook.id) };
                if let Err(e) = client.notify(target, message).await {
                    // Best effort only: runners recover by polling.
                    warn!("Failed to push available tasks to {}: {e}", webhook.url);
                }
                drop(permit);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssignmentNotifier: Send + Sync {
    /// Queue a notification telling a runner about its new assignment. A
    /// notification already in flight for the same task is not queued again.
    async fn notify_assignment(&self, task_id: Uuid, device_id: String);
}

struct AssignmentNotice {
    task_id: Uuid,
    device_id: String,
}

enum DeliveryOutcome {
    Delivered,
    /// The assignment changed underneath us; nothing left to do.
    Aborted,
    Exhausted,
}

pub struct WebhookDispatcherArgs {
    pub tasks: Arc<dyn TaskRepository>,
    pub runners: Arc<dyn RunnerRepository>,
    pub service: Arc<dyn TaskService>,
    pub client: Arc<dyn WebhookClient>,
}

/// Delivers one notification per assignment, re-reading fresh task and runner
/// state before every attempt. When every attempt fails and the assignment
/// still stands, the task is pessimistically failed.
pub struct WebhookDispatcher {
    receiver: mpsc::Receiver<AssignmentNotice>,
    tasks: Arc<dyn TaskRepository>,
    runners: Arc<dyn RunnerRepository>,
    service: Arc<dyn TaskService>,
    client: Arc<dyn WebhookClient>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl WebhookDispatcher {
    pub fn spawn(args: WebhookDispatcherArgs, shutdown: broadcast::Receiver<()>) -> Arc<dyn AssignmentNotifier> {
        let WebhookDispatcherArgs { tasks, runners, service, client } = args;
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        let in_flight: Arc<Mutex<HashSet<Uuid>>> = Default::default();
        let dispatcher =
            Self { receiver, tasks, runners, service, client, in_flight: in_flight.clone() };
        tokio::spawn(dispatcher.run(shutdown));
        Arc::new(DefaultAssignmentNotifier { sender, in_flight })
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let notice = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down webhook dispatcher");
                    break;
                }
                notice = self.receiver.recv() => match notice {
                    Some(notice) => notice,
                    None => {
                        warn!("Notifier dropped, exiting dispatcher");
                        break;
                    }
                }
            };
            tokio::select! {
                _ = self.deliver(notice) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down webhook dispatcher mid-delivery");
                    break;
                }
            }
        }
    }

    async fn deliver(&self, notice: AssignmentNotice) {
        let AssignmentNotice { task_id, device_id } = notice;
        let outcome = self.try_deliver(task_id, &device_id).await;
        self.in_flight.lock().expect("lock poisoned").remove(&task_id);
        if matches!(outcome, DeliveryOutcome::Exhausted) {
            match self.service.fail_delivery(task_id).await {
                Ok(true) => {}
                Ok(false) => debug!("Task {task_id} moved on before it could be failed"),
                Err(e) => error!("Failed to mark task {task_id} undeliverable: {e}"),
            }
        }
    }

    async fn try_deliver(&self, task_id: Uuid, device_id: &str) -> DeliveryOutcome {
        for backoff in NOTIFY_BACKOFF {
            let Some((task, url)) = self.fresh_assignment(task_id, device_id).await else {
                return DeliveryOutcome::Aborted;
            };
            let target = WebhookTarget { url, webhook_id: None };
            let message = WebhookMessage::available_tasks(vec![task.into()]);
            match self.client.notify(target, message).await {
                Ok(()) => {
                    debug!("Notified {device_id} about task {task_id}");
                    return DeliveryOutcome::Delivered;
                }
                Err(e) => warn!("Failed to notify {device_id} about task {task_id}: {e}"),
            }
            tokio::time::sleep(backoff).await;
        }
        // Only fail the task when the assignment is still exactly what we
        // were asked to announce.
        match self.fresh_assignment(task_id, device_id).await {
            Some(_) => DeliveryOutcome::Exhausted,
            None => DeliveryOutcome::Aborted,
        }
    }

    /// Re-read the assignment. Returns the task and the runner's webhook URL
    /// only while the task is Running on that exact runner.
    async fn fresh_assignment(&self, task_id: Uuid, device_id: &str) -> Option<(TaskModel, String)> {
        let task = match self.tasks.find(task_id).await {
            Ok(task) => task,
            Err(e) => {
                debug!("Dropping notification for task {task_id}: {e}");
                return None;
            }
        };
        if task.status != TaskStatus::Running {
            debug!("Dropping notification for task {task_id}: no longer running");
            return None;
        }
        let runner = match self.runners.find(device_id).await {
            Ok(runner) => runner,
            Err(e) => {
                debug!("Dropping notification for task {task_id}: {e}");
                return None;
            }
        };
        if runner.task_id != Some(task_id) {
            debug!("Dropping notification for task {task_id}: runner {device_id} no longer bound");
            return None;
        }
        if runner.webhook.is_empty() {
            debug!("Runner {device_id} has no webhook, leaving task {task_id} to polling");
            return None;
        }
        Some((task, runner.webhook))
    }
}

struct DefaultAssignmentNotifier {
    sender: mpsc::Sender<AssignmentNotice>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

#[async_trait]
impl AssignmentNotifier for DefaultAssignmentNotifier {
    async fn notify_assignment(&self, task_id: Uuid, device_id: String) {
        {
            let mut in_flight = self.in_flight.lock().expect("lock poisoned");
            if !in_flight.insert(task_id) {
                debug!("Notification for task {task_id} already in flight");
                return;
            }
        }
        if self.sender.send(AssignmentNotice { task_id, device_id }).await.is_err() {
            error!("Webhook dispatcher channel dropped");
            self.in_flight.lock().expect("lock poisoned").remove(&task_id);
        }
    }
}

use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 100;

/// Signals exchanged between the task side and the runner side. The matchmaker
/// and the webhook fan-out both subscribe; neither side calls into the other.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    TaskCreated(Uuid),
    TaskReleased(Uuid),
    RunnerOnline(String),
}

/// One-to-many pulse fabric. Publishing never blocks: a subscriber that lags
/// behind misses pulses and recovers on its next periodic sweep.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: TaskEvent) {
        // An error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(TaskEvent::TaskCreated(id));
        assert_eq!(first.recv().await.unwrap(), TaskEvent::TaskCreated(id));
        assert_eq!(second.recv().await.unwrap(), TaskEvent::TaskCreated(id));
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(TaskEvent::RunnerOnline("runner-1".into()));
    }
}

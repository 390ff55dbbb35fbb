use std::sync::Arc;

use fleet_common::TaskView;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::types::LogLine;

const TASK_CHANNEL_CAPACITY: usize = 16;
const LOG_FANOUT_CAPACITY: usize = 1_024;

/// Fan-out point for live subscribers: merged task lists and log lines.
pub struct EventHub {
    tasks: broadcast::Sender<Arc<Vec<TaskView>>>,
    logs: broadcast::Sender<LogLine>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tasks, _) = broadcast::channel(TASK_CHANNEL_CAPACITY);
        let (logs, _) = broadcast::channel(LOG_FANOUT_CAPACITY);
        Self { tasks, logs }
    }

    pub fn subscribe_tasks(&self) -> broadcast::Receiver<Arc<Vec<TaskView>>> {
        self.tasks.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.logs.subscribe()
    }

    pub fn task_subscribers(&self) -> usize {
        self.tasks.receiver_count()
    }

    pub fn publish_tasks(&self, views: Vec<TaskView>) {
        // No receivers is not an error here.
        let _ = self.tasks.send(Arc::new(views));
    }

    pub fn publish_log(&self, line: LogLine) {
        let _ = self.logs.send(line);
    }

    /// Single consumer draining every log worker's channel into the broadcast.
    pub fn spawn_log_pump(self: &Arc<Self>, mut lines: mpsc::Receiver<LogLine>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                hub.publish_log(line);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_pump_forwards_to_subscribers() {
        let hub = Arc::new(EventHub::new());
        let mut rx = hub.subscribe_logs();
        let (tx, lines) = mpsc::channel(4);
        let pump = hub.spawn_log_pump(lines);

        tx.send(LogLine {
            task_id: "t".into(),
            line: "hello".into(),
        })
        .await
        .unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(rx.recv().await.unwrap().line, "hello");
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let hub = EventHub::new();
        assert_eq!(hub.task_subscribers(), 0);
        let rx = hub.subscribe_tasks();
        assert_eq!(hub.task_subscribers(), 1);
        drop(rx);
        assert_eq!(hub.task_subscribers(), 0);
        hub.publish_tasks(Vec::new());
    }
}

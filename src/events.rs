use crate::snapshot::{MetricKind, MetricSnapshot};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Initialized,
    Started,
    Stopped,
    Error(String),
    MetricsCollected(Vec<MetricSnapshot>),
    Metrics(MetricSnapshot),
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::Initialized => "initialized",
            MonitorEvent::Started => "started",
            MonitorEvent::Stopped => "stopped",
            MonitorEvent::Error(_) => "error",
            MonitorEvent::MetricsCollected(_) => "metrics_collected",
            MonitorEvent::Metrics(snapshot) => match snapshot.kind() {
                MetricKind::Memory => "memory_metrics",
                MetricKind::Cpu => "cpu_metrics",
                MetricKind::Disk => "disk_metrics",
                MetricKind::ProcessManager => "processmanager_metrics",
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "событие опубликовано"),
            Err(_) => trace!(event = name, "нет подписчиков на событие"),
        }
    }
}

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::record::{DownloadRecord, DownloadStatus};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum QueueEvent {
    Added(DownloadRecord),
    Updated(DownloadRecord),
    Completed(DownloadRecord),
    Failed(DownloadRecord),
}

impl QueueEvent {
    pub fn record(&self) -> &DownloadRecord {
        match self {
            QueueEvent::Added(r)
            | QueueEvent::Updated(r)
            | QueueEvent::Completed(r)
            | QueueEvent::Failed(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::Added(_) => "added",
            QueueEvent::Updated(_) => "updated",
            QueueEvent::Completed(_) => "completed",
            QueueEvent::Failed(_) => "failed",
        }
    }

    /// Picks the event for a record that just changed.
    pub fn for_record(record: &DownloadRecord) -> Self {
        match record.status {
            DownloadStatus::Completed => QueueEvent::Completed(record.clone()),
            DownloadStatus::Failed => QueueEvent::Failed(record.clone()),
            _ => QueueEvent::Updated(record.clone()),
        }
    }
}

/// Producer side of the lifecycle notifications. Emitting never blocks.
pub trait EventEmitter: Send + Sync + 'static {
    fn emit(&self, event: QueueEvent);
}

/// Broadcast-backed bus. Slow subscribers lag and lose the oldest events
/// instead of stalling producers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: QueueEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("queue event dropped, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record::FormatType;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(status: DownloadStatus) -> DownloadRecord {
        let mut r = DownloadRecord::new(
            "id1".into(),
            "https://example.com".into(),
            FormatType::Video,
            "best".into(),
            PathBuf::from("."),
            Utc::now(),
        );
        r.status = status;
        r
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(QueueEvent::Added(record(DownloadStatus::Pending)));
        bus.emit(QueueEvent::for_record(&record(DownloadStatus::Completed)));

        assert_eq!(rx.recv().await.unwrap().kind(), "added");
        assert_eq!(rx.recv().await.unwrap().kind(), "completed");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(QueueEvent::Updated(record(DownloadStatus::Paused)));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.emit(QueueEvent::Updated(record(DownloadStatus::Downloading)));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn failed_record_maps_to_failed_event() {
        let event = QueueEvent::for_record(&record(DownloadStatus::Failed));
        assert_eq!(event.kind(), "failed");
        assert_eq!(event.record().id, "id1");
    }
}

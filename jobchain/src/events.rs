use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, JobStatus, OperationCode};

/// Envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub job_id: JobId,
    pub operation: OperationCode,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(job_id: JobId, operation: OperationCode) -> Self {
        Self {
            version: 1,
            job_id,
            operation,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(
        job_id: JobId,
        operation: OperationCode,
        payload: JobEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta::new(job_id, operation),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.meta.job_id
    }
}

/// Lifecycle transitions observed by the dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Handed to the worker pool.
    Submitted,
    /// Put back on the transport while a predecessor runs.
    Deferred {
        predecessor: JobId,
        attempt: u32,
        delay_ms: u64,
    },
    /// Moved to `processing`; the handler is about to run.
    Started,
    /// Reached a terminal status without a handler failure.
    Finished { status: JobStatus },
    /// The handler returned an error or panicked.
    Failed { error: String },
    /// No handler was registered for the operation.
    HandlerMissing,
    /// A cancel request was accepted.
    Canceled,
}

/// In-process fan-out of [`JobEvent`]s.
///
/// Publishing never waits; slow subscribers observe
/// `RecvError::Lagged` instead of blocking the dispatcher.
#[derive(Clone)]
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for JobEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Events with no subscribers are dropped.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn emit(
        &self,
        job_id: JobId,
        operation: OperationCode,
        payload: JobEventPayload,
    ) {
        self.publish(JobEvent::new(job_id, operation, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = JobEventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let id = JobId::new();

        bus.emit(id, OperationCode(2), JobEventPayload::Started);

        let event = first.recv().await.unwrap();
        assert_eq!(event.payload, JobEventPayload::Started);
        assert_eq!(second.recv().await.unwrap().job_id(), id);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = JobEventBus::default();
        bus.emit(JobId::new(), OperationCode(2), JobEventPayload::Submitted);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let payload = JobEventPayload::Finished {
            status: JobStatus::Warning,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["status"], "warning");
    }
}

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::job::JobId;

/// Delivery of job ids to the worker pool.
///
/// Delivery is at-least-once at best; the dispatcher tolerates duplicates.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `job_id` as soon as a worker is free.
    async fn submit(&self, job_id: JobId) -> anyhow::Result<()>;

    /// Deliver `job_id` once `delay` has elapsed.
    async fn submit_after(
        &self,
        job_id: JobId,
        delay: Duration,
    ) -> anyhow::Result<()>;
}

/// Transport backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<JobId>,
}

/// Receiving half of a [`ChannelTransport`], consumed by the worker pool.
pub type JobReceiver = mpsc::UnboundedReceiver<JobId>;

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl ChannelTransport {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn submit(&self, job_id: JobId) -> anyhow::Result<()> {
        self.sender
            .send(job_id)
            .map_err(|_| {
                anyhow::anyhow!("job transport closed, dropping {job_id}")
            })
    }

    async fn submit_after(
        &self,
        job_id: JobId,
        delay: Duration,
    ) -> anyhow::Result<()> {
        if delay.is_zero() {
            return self.submit(job_id).await;
        }
        if self.sender.is_closed() {
            anyhow::bail!("job transport closed, dropping {job_id}");
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(job_id).is_err() {
                tracing::warn!(
                    %job_id,
                    "transport closed before delayed submission"
                );
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_delivers_in_order() {
        let (transport, mut rx) = ChannelTransport::new();
        let a = JobId::new();
        let b = JobId::new();
        transport.submit(a).await.unwrap();
        transport.submit(b).await.unwrap();
        assert_eq!(rx.recv().await, Some(a));
        assert_eq!(rx.recv().await, Some(b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_waits_for_delay() {
        let (transport, mut rx) = ChannelTransport::new();
        let id = JobId::new();
        transport
            .submit_after(id, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn test_submit_fails_once_receiver_is_gone() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert!(transport.submit(JobId::new()).await.is_err());
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::context::CancelToken;
use crate::service::JobService;
use crate::transport::JobReceiver;

use super::dispatch::Dispatcher;

/// Signals graceful shutdown to workers. Shares its implementation with
/// the per-job cancellation token.
pub type ShutdownToken = CancelToken;

/// A configured scheduler: the service facade plus the worker pool draining
/// the channel transport.
pub struct SchedulerRuntime {
    config: SchedulerConfig,
    service: Arc<JobService>,
    dispatcher: Arc<Dispatcher>,
    receiver: Option<Arc<Mutex<JobReceiver>>>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for SchedulerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("SchedulerRuntime")
            .field("config", &self.config)
            .field("service", &self.service)
            .field("owns_transport", &self.receiver.is_some())
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_canceled())
            .finish()
    }
}

impl SchedulerRuntime {
    pub(crate) fn new(
        config: SchedulerConfig,
        service: Arc<JobService>,
        dispatcher: Arc<Dispatcher>,
        receiver: Option<JobReceiver>,
    ) -> Self {
        Self {
            config,
            service,
            dispatcher,
            receiver: receiver.map(|receiver| Arc::new(Mutex::new(receiver))),
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn service(&self) -> Arc<JobService> {
        Arc::clone(&self.service)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawns `worker.parallelism` workers. With an external transport there
    /// is nothing to drain and no worker is started.
    pub async fn start(&self) -> anyhow::Result<()> {
        let Some(receiver) = &self.receiver else {
            tracing::warn!(
                "runtime uses an external transport, no workers started"
            );
            return Ok(());
        };

        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() {
            anyhow::bail!("scheduler runtime already started");
        }

        for index in 0..self.config.worker.parallelism {
            let worker_id = self.config.worker.worker_id(index);
            let receiver = Arc::clone(receiver);
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = self.shutdown_token.clone();

            handles.push(tokio::spawn(Self::worker_loop(
                worker_id, receiver, dispatcher, shutdown,
            )));
        }

        tracing::info!(
            workers = self.config.worker.parallelism,
            "scheduler runtime started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for each worker to finish its current job,
    /// up to `worker.shutdown_timeout_secs` per worker.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of scheduler runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout =
            Duration::from_secs(self.config.worker.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Worker task timed out during shutdown")
                }
            }
        }

        tracing::info!("Scheduler runtime shutdown complete");
        Ok(())
    }

    async fn worker_loop(
        worker_id: String,
        receiver: Arc<Mutex<JobReceiver>>,
        dispatcher: Arc<Dispatcher>,
        shutdown: ShutdownToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.canceled() => {
                    tracing::info!("Worker {} shutting down", worker_id);
                    break;
                }
                next = async { receiver.lock().await.recv().await } => next,
            };

            let Some(job_id) = next else {
                tracing::info!(
                    "Worker {} stopping, transport closed",
                    worker_id
                );
                break;
            };

            let report = dispatcher.execute(job_id).await;
            tracing::debug!(
                worker = %worker_id,
                %job_id,
                ?report,
                "execution attempt finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_token_shares_state_with_clones() {
        let token = ShutdownToken::new();
        let worker_side: CancelToken = token.clone();
        let waiter = tokio::spawn(async move { worker_side.canceled().await });
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_canceled_returns_immediately_after_cancel() {
        let token = ShutdownToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.canceled())
            .await
            .unwrap();
        assert!(token.is_canceled());
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use jobchain::*;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Handler that records each run and returns a configurable outcome.
#[derive(Clone)]
pub struct MockHandler {
    runs: Arc<Mutex<Vec<JobId>>>,
    outcome: Arc<Mutex<JobOutcome>>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::with_outcome(JobOutcome::Done)
    }

    pub fn with_outcome(outcome: JobOutcome) -> Self {
        Self {
            runs: Arc::new(Mutex::new(Vec::new())),
            outcome: Arc::new(Mutex::new(outcome)),
        }
    }

    pub fn runs(&self) -> Vec<JobId> {
        self.runs.lock().clone()
    }

    pub fn assert_run_count_eq(&self, expected: usize) {
        let actual = self.runs.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} runs, got {}",
            expected, actual
        );
    }

    pub fn set_outcome(&self, outcome: JobOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn shared(&self) -> Arc<dyn JobHandler> {
        Arc::new(self.clone())
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for MockHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        self.runs.lock().push(ctx.job_id());
        Ok(self.outcome.lock().clone())
    }
}

/// Handler that parks until [`BlockingHandler::release`] is called.
#[derive(Clone, Default)]
pub struct BlockingHandler {
    started: Arc<Notify>,
    gate: Arc<Notify>,
    runs: Arc<Mutex<Vec<JobId>>>,
}

impl BlockingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once a run has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Lets one parked run finish.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn runs(&self) -> Vec<JobId> {
        self.runs.lock().clone()
    }

    pub fn shared(&self) -> Arc<dyn JobHandler> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        self.runs.lock().push(ctx.job_id());
        self.started.notify_one();
        self.gate.notified().await;
        Ok(JobOutcome::Done)
    }
}

/// Handler that always returns an error.
#[derive(Clone, Debug)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn shared(&self) -> Arc<dyn JobHandler> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<JobOutcome> {
        anyhow::bail!("{}", self.message)
    }
}

/// Handler that panics.
#[derive(Clone, Debug)]
pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<JobOutcome> {
        panic!("handler exploded")
    }
}

/// Handler that waits for a cancel request and then stops.
#[derive(Clone, Default)]
pub struct CancelAwareHandler {
    started: Arc<Notify>,
}

impl CancelAwareHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn shared(&self) -> Arc<dyn JobHandler> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl JobHandler for CancelAwareHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        self.started.notify_one();
        ctx.cancel_token().canceled().await;
        Ok(JobOutcome::Canceled)
    }
}

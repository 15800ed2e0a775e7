use std::path::Path;
use std::sync::Arc;

use jobchain::*;
use tempfile::TempDir;

pub const TEST_OWNER: OwnerId = OwnerId(7);

pub fn entry(id: i64) -> ObjectRef {
    ObjectRef::new(id, format!("entry-{id}"))
}

pub fn entity(id: i64) -> ObjectRef {
    ObjectRef::new(id, format!("entity-{id}"))
}

pub fn params(value: serde_json::Value) -> JobParams {
    JobParams::from_value(value)
}

/// Configuration with no damping or transport delay and a short attempt cap.
pub fn test_config(max_resubmits: u32) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_dependency(DependencyConfig::immediate(Some(max_resubmits)))
}

/// A service wired to an in-memory store and a [`crate::RecordingTransport`],
/// so tests drive execution by hand. The result cache lives in a temporary
/// directory removed when the harness is dropped.
pub struct ServiceHarness {
    pub service: Arc<JobService>,
    pub store: Arc<InMemoryJobStore>,
    pub transport: Arc<crate::RecordingTransport>,
    pub registry: Arc<OperationRegistry>,
    pub notifier: Arc<crate::RecordingNotifier>,
    cache_dir: TempDir,
}

impl ServiceHarness {
    pub fn new(config: SchedulerConfig) -> anyhow::Result<Self> {
        Self::with_registry(
            config,
            Arc::new(OperationRegistry::with_core_operations()),
        )
    }

    pub fn with_registry(
        config: SchedulerConfig,
        registry: Arc<OperationRegistry>,
    ) -> anyhow::Result<Self> {
        let cache_dir = tempfile::tempdir()?;
        let config = config.with_cache_dir(cache_dir.path());
        let store = Arc::new(InMemoryJobStore::new());
        let transport = Arc::new(crate::RecordingTransport::new());
        let notifier = Arc::new(crate::RecordingNotifier::new());
        let runtime = SchedulerRuntimeBuilder::new(config)
            .with_store(store.clone())
            .with_registry(Arc::clone(&registry))
            .with_transport(transport.clone())
            .with_notifier(notifier.clone())
            .build()?;

        Ok(Self {
            service: runtime.service(),
            store,
            transport,
            registry,
            notifier,
            cache_dir,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache_dir.path()
    }

    /// Executes every submission recorded so far, in order, and returns the
    /// reports. Submissions made during execution are left for the next call.
    pub async fn drain(&self) -> Vec<(JobId, ExecutionReport)> {
        let dispatcher = self.service.dispatcher();
        let mut reports = Vec::new();
        for submission in self.transport.take() {
            let report = dispatcher.execute(submission.job_id).await;
            reports.push((submission.job_id, report));
        }
        reports
    }
}

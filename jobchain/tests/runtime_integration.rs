//! Runtime integration tests for the jobchain worker pool.
//!
//! Tests dependency ordering across workers, failure and panic handling,
//! cooperative cancellation, the result cache and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use jobchain::*;
use jobchain_testkit::{
    CancelAwareHandler, FailingHandler, MockHandler, PanickingHandler,
    RecordingNotifier, TEST_OWNER, entry, init_tracing,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

struct TestRuntime {
    runtime: SchedulerRuntime,
    service: Arc<JobService>,
    notifier: Arc<RecordingNotifier>,
    events: broadcast::Receiver<JobEvent>,
    _cache_dir: tempfile::TempDir,
}

fn runtime_config(cache_dir: &std::path::Path) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_cache_dir(cache_dir)
        .with_worker(WorkerConfig::new(4).with_shutdown_timeout(5))
        .with_dependency(DependencyConfig {
            damping_delay_ms: 0,
            resubmit_base_delay_ms: 10,
            resubmit_max_delay_ms: 40,
            max_resubmits: Some(1_000),
        })
}

async fn start_runtime(registry: Arc<OperationRegistry>) -> TestRuntime {
    init_tracing();
    let cache_dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let runtime = SchedulerRuntimeBuilder::new(runtime_config(cache_dir.path()))
        .with_store(Arc::new(InMemoryJobStore::new()))
        .with_registry(registry)
        .with_notifier(notifier.clone())
        .build()
        .unwrap();
    let service = runtime.service();
    let events = service.events().subscribe();
    runtime.start().await.unwrap();

    TestRuntime {
        runtime,
        service,
        notifier,
        events,
        _cache_dir: cache_dir,
    }
}

/// Waits until `job_id` finishes or fails and returns the reported status.
async fn wait_for_end(
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: JobId,
) -> JobStatus {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.job_id() != job_id {
                continue;
            }
            match event.payload {
                JobEventPayload::Finished { status } => return status,
                JobEventPayload::Failed { .. } => return JobStatus::Error,
                _ => continue,
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

/// Records the order in which runs start and end.
#[derive(Clone, Default)]
struct OrderingHandler {
    log: Arc<Mutex<Vec<(JobId, &'static str)>>>,
}

#[async_trait::async_trait]
impl JobHandler for OrderingHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        self.log.lock().push((ctx.job_id(), "start"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.log.lock().push((ctx.job_id(), "end"));
        Ok(JobOutcome::Done)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chained_edits_run_one_after_another() {
    let handler = OrderingHandler::default();
    let registry = Arc::new(OperationRegistry::with_core_operations());
    registry
        .register(codes::EDIT_ENTRY, Arc::new(handler.clone()))
        .unwrap();
    let mut rt = start_runtime(registry).await;

    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(
            rt.service
                .new_edit(TEST_OWNER, entry(42), "", JobParams::empty())
                .await
                .unwrap(),
        );
    }
    for job in jobs.iter().rev() {
        rt.service
            .submit(job.id, RunMode::Asynchronous)
            .await
            .unwrap();
    }

    for job in &jobs {
        assert_eq!(wait_for_end(&mut rt.events, job.id).await, JobStatus::Done);
    }

    let expected: Vec<(JobId, &str)> = jobs
        .iter()
        .flat_map(|job| [(job.id, "start"), (job.id, "end")])
        .collect();
    assert_eq!(*handler.log.lock(), expected);

    rt.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_error_marks_job_and_notifies_operator() {
    let registry = Arc::new(OperationRegistry::with_core_operations());
    let failing = FailingHandler::new("csv row 3 is malformed");
    registry
        .register(codes::IMPORT_ENTRY, failing.shared())
        .unwrap();
    let mut rt = start_runtime(registry).await;

    let job = rt
        .service
        .new_import(TEST_OWNER, entry(1), "importing", JobParams::empty())
        .await
        .unwrap();
    rt.service.submit(job.id, RunMode::Asynchronous).await.unwrap();
    assert_eq!(wait_for_end(&mut rt.events, job.id).await, JobStatus::Error);

    let record = rt.service.fetch(job.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert_eq!(record.text, "importing\ncsv row 3 is malformed");

    let failures = rt.notifier.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job_id, job.id);
    assert!(!failures[0].panicked);

    rt.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let healthy = MockHandler::new();
    let registry = Arc::new(OperationRegistry::with_core_operations());
    registry
        .register(codes::DELETE_ENTRY, Arc::new(PanickingHandler))
        .unwrap();
    registry
        .register(codes::RESTORE_ENTRY, healthy.shared())
        .unwrap();
    let mut rt = start_runtime(registry).await;

    let doomed = rt
        .service
        .new_delete(TEST_OWNER, entry(1), "", JobParams::empty())
        .await
        .unwrap();
    rt.service.submit(doomed.id, RunMode::Asynchronous).await.unwrap();
    assert_eq!(wait_for_end(&mut rt.events, doomed.id).await, JobStatus::Error);

    let record = rt.service.fetch(doomed.id).await.unwrap();
    assert!(record.text.contains("handler exploded"));
    assert!(rt.notifier.failures()[0].panicked);

    let next = rt
        .service
        .new_restore(TEST_OWNER, entry(1), "", JobParams::empty())
        .await
        .unwrap();
    rt.service.submit(next.id, RunMode::Asynchronous).await.unwrap();
    assert_eq!(wait_for_end(&mut rt.events, next.id).await, JobStatus::Done);
    healthy.assert_run_count_eq(1);

    rt.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn running_job_observes_cancel() {
    let handler = CancelAwareHandler::new();
    let registry = Arc::new(OperationRegistry::with_core_operations());
    registry
        .register(codes::COPY_ENTRY, handler.shared())
        .unwrap();
    let mut rt = start_runtime(registry).await;

    let job = rt
        .service
        .new_copy(TEST_OWNER, entry(1), "", JobParams::empty())
        .await
        .unwrap();
    rt.service.submit(job.id, RunMode::Asynchronous).await.unwrap();
    timeout(Duration::from_secs(5), handler.wait_started())
        .await
        .unwrap();

    assert_eq!(
        rt.service.cancel(job.id).await.unwrap(),
        CancelOutcome::Canceled { signaled: true }
    );
    assert_eq!(wait_for_end(&mut rt.events, job.id).await, JobStatus::Canceled);
    assert!(rt.service.is_canceled(job.id).await.unwrap());

    rt.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn synchronous_run_appends_warning() {
    let registry = Arc::new(OperationRegistry::with_core_operations());
    registry
        .register(
            codes::EXPORT_ENTRY,
            handler_fn(|ctx: JobContext| async move {
                ctx.set_cache(b"id,name\n1,vm-01\n").await?;
                ctx.set_text("exported 1 row").await?;
                Ok(JobOutcome::Warning("2 rows skipped".to_string()))
            }),
        )
        .unwrap();
    let rt = start_runtime(registry).await;

    let job = rt
        .service
        .new_export(TEST_OWNER, Some(entry(1)), "", JobParams::empty())
        .await
        .unwrap();
    let outcome = rt
        .service
        .submit(job.id, RunMode::Synchronous)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Executed(ExecutionReport::Finished {
            status: JobStatus::Warning
        })
    );

    let record = rt.service.fetch(job.id).await.unwrap();
    assert_eq!(record.text, "exported 1 row\n2 rows skipped");
    assert_eq!(
        rt.service.get_cache(job.id).await.unwrap(),
        b"id,name\n1,vm-01\n".to_vec()
    );
    assert!(matches!(
        rt.service.get_cache(JobId::new()).await,
        Err(CacheError::NotFound { .. })
    ));

    rt.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_delivery_runs_handler_once() {
    let handler = MockHandler::new();
    let registry = Arc::new(OperationRegistry::with_core_operations());
    registry
        .register(codes::CREATE_ENTRY, handler.shared())
        .unwrap();
    let rt = start_runtime(registry).await;

    let job = rt
        .service
        .new_create(TEST_OWNER, entry(1), "", JobParams::empty())
        .await
        .unwrap();
    let dispatcher = rt.service.dispatcher();
    let attempts = (0..4).map(|_| dispatcher.execute(job.id));
    let reports = futures::future::join_all(attempts).await;

    let finished = reports
        .iter()
        .filter(|report| matches!(report, ExecutionReport::Finished { .. }))
        .count();
    assert_eq!(finished, 1);
    handler.assert_run_count_eq(1);

    rt.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_idle_workers() {
    let registry = Arc::new(OperationRegistry::with_core_operations());
    let rt = start_runtime(registry).await;
    timeout(Duration::from_secs(2), rt.runtime.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert!(rt.runtime.shutdown_token().is_canceled());
}

#[tokio::test]
async fn cancel_wins_over_late_completion() {
    let handler = jobchain_testkit::BlockingHandler::new();
    let registry = Arc::new(OperationRegistry::with_core_operations());
    registry
        .register(codes::EDIT_ENTRY, handler.shared())
        .unwrap();
    let mut rt = start_runtime(registry).await;

    let job = rt
        .service
        .new_edit(TEST_OWNER, entry(1), "", JobParams::empty())
        .await
        .unwrap();
    rt.service.submit(job.id, RunMode::Asynchronous).await.unwrap();
    timeout(Duration::from_secs(5), handler.wait_started())
        .await
        .unwrap();

    assert_eq!(
        rt.service.cancel(job.id).await.unwrap(),
        CancelOutcome::Canceled { signaled: true }
    );
    handler.release();

    // The handler ignored the token and returned Done. The cancel stands.
    let end = wait_for_end(&mut rt.events, job.id).await;
    assert_eq!(end, JobStatus::Canceled);
    assert_eq!(handler.runs(), vec![job.id]);

    rt.runtime.shutdown().await.unwrap();
}

/// Runtime builder wiring store, registry, transport and service.
pub mod builder;
/// Dispatch of a single job: readiness, claim, handler, outcome.
pub mod dispatch;
/// Runtime supervisor managing the worker pool.
pub mod supervisor;
/// Worker pool configuration.
pub mod worker;

pub use builder::SchedulerRuntimeBuilder;
pub use dispatch::{Dispatcher, ExecutionReport, RunMode, RunOutcome};
pub use supervisor::{SchedulerRuntime, ShutdownToken};
pub use worker::WorkerConfig;

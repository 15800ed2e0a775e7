//! Jobchain - dependency-ordered job scheduling for entry and entity
//! operations.
//!
//! Jobs are records describing a long-running operation (edit, delete,
//! export, notify...) on a target object. Jobs for the same target and the
//! same non-parallelizable operation run one after another: a job waits for
//! its predecessor and is resubmitted with backoff until the predecessor has
//! finished or gone stale.
//!
//! # Core Concepts
//!
//! - **Job record**: [`JobRecord`] with its [`JobStatus`] lifecycle and the
//!   update rules in [`JobRecord::apply_update`].
//!
//! - **Operations**: numeric [`OperationCode`]s banded into core, custom and
//!   plugin ranges, described in an [`OperationRegistry`] together with their
//!   [`JobHandler`]s.
//!
//! - **Plugins**: [`JobPlugin`]s declare operations by offset; a
//!   [`PluginCatalog`] is validated against configured [`PluginRange`]s.
//!
//! - **Dependencies**: the [`DependencyResolver`] assigns predecessors and
//!   decides whether a job may start.
//!
//! - **Runtime**: [`SchedulerRuntime`] wires a [`JobStore`], a [`Transport`]
//!   and a worker pool, and exposes the [`JobService`] facade.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL job store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use jobchain::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(OperationRegistry::with_core_operations());
//! let edit = handler_fn(|ctx: JobContext| async move {
//!     ctx.set_text("50%").await?;
//!     Ok(JobOutcome::Done)
//! });
//! registry.register(codes::EDIT_ENTRY, edit)?;
//!
//! let runtime = SchedulerRuntimeBuilder::new(SchedulerConfig::default())
//!     .with_store(Arc::new(InMemoryJobStore::new()))
//!     .with_registry(registry)
//!     .build()?;
//! runtime.start().await?;
//!
//! let service = runtime.service();
//! let params = JobParams::empty();
//! let job = service
//!     .new_edit(OwnerId(7), ObjectRef::new(42, "vm-01"), "", params)
//!     .await?;
//! service.submit(job.id, RunMode::Asynchronous).await?;
//! ```

/// File-backed result cache keyed by job id.
pub mod cache;

/// Scheduler configuration loaded from TOML.
///
/// The `config` module defines [`SchedulerConfig`] and
/// [`DependencyConfig`] together with their validation.
pub mod config;

/// Execution context handed to handlers and cooperative cancellation.
pub mod context;

/// Error types for registration, configuration, job and cache operations.
pub mod error;

/// Job lifecycle events and the in-process event bus.
///
/// The `events` module provides [`JobEvent`], [`JobEventPayload`] and the
/// broadcast-based [`JobEventBus`].
pub mod events;

/// Core job definitions.
///
/// The `job` module defines the fundamental job data:
/// - [`JobRecord`] - the stored job with its update rules
/// - [`JobStatus`] - lifecycle states and their numeric codes
/// - [`JobUpdate`] - a partial update request
/// - [`TargetRef`] and [`TargetKey`] - the object a job acts on
/// - [`JobParams`] - canonical JSON parameters
/// - [`JobId`], [`OwnerId`] and [`OperationCode`] - identifiers
pub mod job;

/// Staleness rules deriving the `timeout` status.
pub mod liveness;

/// Operator notification of failed jobs.
pub mod notify;

/// Operation codes, flags and the handler trait.
///
/// The `operation` module provides the [`JobHandler`] trait, the core
/// operation table, [`OperationFlags`] and the code bands.
pub mod operation;

/// Plugin declarations, ranges and their validation.
pub mod plugin;

/// Operation registry mapping codes to metadata and handlers.
pub mod registry;

/// Dependency assignment and readiness checks.
pub mod resolver;

/// High-level job service: creation, submission, updates and queries.
pub mod service;

/// Job persistence abstraction and the in-memory store.
pub mod store;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

/// Delivery of job ids to the worker pool.
pub mod transport;

#[cfg(feature = "metrics")]
/// Prometheus metrics for job scheduling.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed implementation
/// of the job store when the `postgres` feature is enabled.
pub mod persistence;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides the [`SchedulerRuntime`] for managing the
/// worker pool and job execution lifecycle. Includes:
/// - [`SchedulerRuntime`] - main runtime type
/// - [`SchedulerRuntimeBuilder`] - dependency wiring
/// - [`Dispatcher`] - single-job execution
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkerConfig`] - worker pool configuration
pub mod runtime;

pub use cache::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use notify::*;
pub use operation::*;
pub use plugin::*;
pub use registry::*;
pub use resolver::*;
pub use runtime::*;
pub use service::*;
pub use store::*;
pub use transport::*;

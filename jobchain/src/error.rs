use thiserror::Error;

use crate::job::{JobId, OperationCode};

/// Errors raised while building or mutating the operation registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operation {0} is not registered")]
    UnknownOperation(OperationCode),
    #[error("a handler for operation {0} is already registered")]
    HandlerAlreadyRegistered(OperationCode),
    #[error("operation code {0} is outside the custom band 100-199")]
    OutsideCustomBand(OperationCode),
    #[error("operation code {0} is already defined")]
    DuplicateOperation(OperationCode),
    #[error("plugin {plugin_id} is already registered")]
    PluginAlreadyRegistered { plugin_id: String },
}

/// Startup configuration problems. Any of these aborts initialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("plugin {plugin_id} has no configured operation range")]
    MissingRange { plugin_id: String },
    #[error("plugin {plugin_id} range {start}-{end} is inverted")]
    InvertedRange {
        plugin_id: String,
        start: u32,
        end: u32,
    },
    #[error("plugin {plugin_id} range {start}-{end} overlaps the reserved band 1-199")]
    ReservedBandOverlap {
        plugin_id: String,
        start: u32,
        end: u32,
    },
    #[error("plugin {plugin_id} range {start}-{end} exceeds the plugin band 200-9999")]
    OutsidePluginBand {
        plugin_id: String,
        start: u32,
        end: u32,
    },
    #[error("plugin ranges of {first} and {second} overlap")]
    OverlappingRanges { first: String, second: String },
    #[error("plugin {plugin_id} operation {operation} offset {offset} falls outside its range")]
    OffsetOutOfRange {
        plugin_id: String,
        operation: String,
        offset: u32,
    },
    #[error("operation code {code} is declared by both {first} and {second}")]
    CodeCollision {
        code: u32,
        first: String,
        second: String,
    },
    #[error("plugin {plugin_id} flags undeclared operation {operation}")]
    UnknownFlaggedOperation {
        plugin_id: String,
        operation: String,
    },
    #[error("plugin {plugin_id} provides no handler for function {function_name}")]
    MissingPluginHandler {
        plugin_id: String,
        function_name: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failures surfaced by job lifecycle calls on the service.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("operation {0} does not allow cancellation")]
    NotCancelable(OperationCode),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cached result for job {job_id}")]
    NotFound { job_id: JobId },
    #[error("cache I/O failed for job {job_id}: {source}")]
    Io {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },
}

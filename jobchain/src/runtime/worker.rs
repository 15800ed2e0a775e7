use serde::{Deserialize, Serialize};

/// Configuration for the worker pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers pulling job ids from the transport.
    pub parallelism: usize,
    /// How long shutdown waits for each worker, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Prefix for worker ids in logs; the process id is appended.
    pub worker_prefix: String,
}

impl WorkerConfig {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Self::default()
        }
    }

    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub(crate) fn worker_id(&self, index: usize) -> String {
        format!("{}-{}-w{}", self.worker_prefix, std::process::id(), index)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            shutdown_timeout_secs: 30,
            worker_prefix: "jobchain".to_string(),
        }
    }
}

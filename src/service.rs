use std::time::Duration;

use tracing::{debug, warn};

use crate::worker::{WorkerClient, WorkerStopped};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The worker did not answer a read within the configured bound.
    HandoffTimeout { waited: Duration },
    WorkerUnavailable,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandoffTimeout { waited } => {
                write!(f, "persistence worker did not answer within {waited:?}")
            }
            Self::WorkerUnavailable => write!(f, "persistence worker is unavailable"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<WorkerStopped> for ServiceError {
    fn from(_: WorkerStopped) -> Self {
        Self::WorkerUnavailable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Submitted,
    /// Blank values are dropped without reaching the worker.
    IgnoredBlank,
}

/// Front-end adapter over the persistence worker protocol.
#[derive(Debug, Clone)]
pub struct StoreService {
    worker: WorkerClient,
    read_timeout: Duration,
}

impl StoreService {
    pub fn new(worker: WorkerClient, read_timeout: Duration) -> Self {
        Self {
            worker,
            read_timeout,
        }
    }

    /// Returns the value current at the moment the worker serviced this read.
    pub async fn read_value(&self) -> Result<String, ServiceError> {
        let reply = self.worker.request_read()?;
        match tokio::time::timeout(self.read_timeout, reply).await {
            Ok(Ok(value)) => Ok(value),
            // Reply sender dropped without answering: the worker is gone.
            Ok(Err(_)) => Err(ServiceError::WorkerUnavailable),
            Err(_) => {
                warn!(timeout = ?self.read_timeout, "read handoff timed out");
                Err(ServiceError::HandoffTimeout {
                    waited: self.read_timeout,
                })
            }
        }
    }

    /// Does not wait for the value to be installed or flushed. The value is
    /// stored as given; trimming only decides whether it is blank.
    pub fn write_value(&self, value: String) -> Result<WriteOutcome, ServiceError> {
        if value.trim().is_empty() {
            debug!("ignoring blank name write");
            return Ok(WriteOutcome::IgnoredBlank);
        }
        self.worker.submit_write(value)?;
        Ok(WriteOutcome::Submitted)
    }
}

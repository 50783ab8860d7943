use thiserror::Error;

use crate::connection::ConnectionId;
use crate::types::job::JobId;
use crate::types::states::JobStatus;

/// Faults inside the broker. None of these are caused by client input: each
/// indicates an inconsistency that aborts the current command, which is then
/// answered with `INTERNAL_ERROR`.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot order job {left} ({left_state}) against job {right} ({right_state})")]
    IncomparableJobs {
        left: JobId,
        left_state: JobStatus,
        right: JobId,
        right_state: JobStatus,
    },

    #[error("job {0} is indexed but missing from the job table")]
    MissingJob(JobId),

    #[error("connection {0} is not registered")]
    MissingConnection(ConnectionId),

    #[error("connection {0} can't wait for a job in its current state")]
    CannotWait(ConnectionId),

    #[error("serialising stats: {0}")]
    Stats(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

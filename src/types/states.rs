use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

use crate::connection::ConnectionId;

/// Who holds a reserved job, and until when.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Reservation {
    pub(crate) by: ConnectionId,
    pub(crate) timeout_at: Instant,
}

/// A job's state, including any state-specific data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum JobState {
    Ready,
    Delayed,
    Reserved(Reservation),
    /// Still reserved, but within a second of its TTR expiring.
    DeadlinePending(Reservation),
    Buried,
    Deleted,
}

impl JobState {
    pub(crate) fn status(&self) -> JobStatus {
        match self {
            Self::Ready => JobStatus::Ready,
            Self::Delayed => JobStatus::Delayed,
            Self::Reserved(_) => JobStatus::Reserved,
            Self::DeadlinePending(_) => JobStatus::DeadlinePending,
            Self::Buried => JobStatus::Buried,
            Self::Deleted => JobStatus::Deleted,
        }
    }

    /// The reservation, for both reserved states.
    pub(crate) fn reservation(&self) -> Option<&Reservation> {
        match self {
            Self::Reserved(r) | Self::DeadlinePending(r) => Some(r),
            _ => None,
        }
    }
}

/// The name of a job's state, without its data.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JobStatus {
    Ready,
    Delayed,
    Reserved,
    DeadlinePending,
    Buried,
    Deleted,
}

impl JobStatus {
    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved | Self::DeadlinePending)
    }

    /// The name clients see in `stats-job`. A pending deadline is reported
    /// as plain `reserved`.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delayed => "delayed",
            Self::Reserved | Self::DeadlinePending => "reserved",
            Self::Buried => "buried",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::DeadlinePending => "deadline-pending",
            other => other.wire_name(),
        })
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.wire_name())
    }
}

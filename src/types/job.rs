use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::protocol::JobStats;
use super::states::{JobState, JobStatus, Reservation};
use crate::connection::ConnectionId;
use crate::error::{BrokerError, Result};

pub type JobId = u64;

/// Ready jobs with a priority below this count as urgent.
pub(crate) const URGENT_PRIORITY: u32 = 1024;

/// How close to its TTR expiring a reservation must be for the holder to be
/// warned with `DEADLINE_SOON`.
const DEADLINE_WINDOW: Duration = Duration::from_secs(1);

/// Per-job counts of state transitions, reported by `stats-job`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct JobCounters {
    pub(crate) reserves: u64,
    pub(crate) timeouts: u64,
    pub(crate) releases: u64,
    pub(crate) buries: u64,
    pub(crate) kicks: u64,
}

/// A reservation that lapsed while the job was being reconciled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Timeout {
    pub(crate) job: JobId,
    pub(crate) connection: ConnectionId,
}

/// A single job and its state machine.
///
/// Time-based transitions (delay expiry, TTR expiry, deadline-soon) are
/// applied lazily by [`Job::reconcile`]. Every other transition expects the
/// job to have been reconciled at the same `now` it is given.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) tube: String,
    pub(crate) pri: u32,
    pub(crate) delay: u32,
    pub(crate) ttr: u32,
    pub(crate) data: Bytes,
    state: JobState,
    pub(crate) created: Instant,
    pub(crate) ready_at: Instant,
    pub(crate) buried_at: Option<Instant>,
    pub(crate) counters: JobCounters,
}

impl Job {
    /// Creates a job that is delayed if `delay` is non-zero, otherwise ready.
    /// A zero TTR is raised to one second.
    pub(crate) fn new(
        id: JobId,
        tube: String,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
        now: Instant,
    ) -> Self {
        Self {
            id,
            tube,
            pri,
            delay,
            ttr: ttr.max(1),
            data,
            state: if delay > 0 {
                JobState::Delayed
            } else {
                JobState::Ready
            },
            created: now,
            ready_at: now + secs(delay),
            buried_at: None,
            counters: JobCounters::default(),
        }
    }

    /// The state as of the last reconciliation.
    pub(crate) fn state(&self) -> &JobState {
        &self.state
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.state.status()
    }

    /// Applies any time-based transitions due at `now`. If the job's
    /// reservation has lapsed, it becomes ready again and the lapsed
    /// reservation is returned so the broker can react to it.
    pub(crate) fn reconcile(&mut self, now: Instant) -> Option<Timeout> {
        match self.state {
            JobState::Delayed if self.ready_at <= now => {
                self.state = JobState::Ready;
                None
            },
            JobState::Reserved(r) | JobState::DeadlinePending(r)
                if now > r.timeout_at =>
            {
                self.state = JobState::Ready;
                self.counters.timeouts += 1;
                Some(Timeout {
                    job: self.id,
                    connection: r.by,
                })
            },
            JobState::Reserved(r) if now + DEADLINE_WINDOW >= r.timeout_at => {
                self.state = JobState::DeadlinePending(r);
                None
            },
            _ => None,
        }
    }

    pub(crate) fn is_reserved_by(&self, by: ConnectionId) -> bool {
        self.state.reservation().is_some_and(|r| r.by == by)
    }

    /// Claims a ready job for `by`. Returns false if the job isn't ready,
    /// which is how a losing concurrent claimant finds out.
    pub(crate) fn reserve(&mut self, by: ConnectionId, now: Instant) -> bool {
        if self.state != JobState::Ready {
            return false;
        }

        self.state = JobState::Reserved(Reservation {
            by,
            timeout_at: now + secs(self.ttr),
        });
        self.counters.reserves += 1;
        true
    }

    /// Returns a job reserved by `by` to the ready or delayed states.
    /// `counted` is false when the release is implied by a disconnect.
    pub(crate) fn release(
        &mut self,
        by: ConnectionId,
        pri: u32,
        delay: u32,
        counted: bool,
        now: Instant,
    ) -> bool {
        if !self.is_reserved_by(by) {
            return false;
        }

        self.state = if delay > 0 {
            JobState::Delayed
        } else {
            JobState::Ready
        };
        if counted {
            self.counters.releases += 1;
        }
        self.pri = pri;
        self.delay = delay;
        self.ready_at = now + secs(delay);
        true
    }

    pub(crate) fn bury(
        &mut self,
        by: ConnectionId,
        pri: u32,
        now: Instant,
    ) -> bool {
        if !self.is_reserved_by(by) {
            return false;
        }

        self.state = JobState::Buried;
        self.counters.buries += 1;
        self.pri = pri;
        self.buried_at = Some(now);
        true
    }

    /// Promotes a buried or delayed job to ready.
    pub(crate) fn kick(&mut self, now: Instant) -> bool {
        if !matches!(self.state, JobState::Buried | JobState::Delayed) {
            return false;
        }

        self.state = JobState::Ready;
        self.counters.kicks += 1;
        self.ready_at = now;
        self.buried_at = None;
        true
    }

    /// Deletes the job unless another connection holds it reserved.
    pub(crate) fn delete(&mut self, by: ConnectionId) -> bool {
        match self.state {
            JobState::Deleted => false,
            JobState::Reserved(r) | JobState::DeadlinePending(r)
                if r.by != by =>
            {
                false
            },
            _ => {
                self.state = JobState::Deleted;
                true
            },
        }
    }

    /// Restarts the TTR of a job reserved by `by`.
    pub(crate) fn touch(&mut self, by: ConnectionId, now: Instant) -> bool {
        match self.state {
            JobState::Reserved(r) | JobState::DeadlinePending(r)
                if r.by == by =>
            {
                self.state = JobState::Reserved(Reservation {
                    timeout_at: now + secs(self.ttr),
                    ..r
                });
                true
            },
            _ => false,
        }
    }

    /// Whether this job should be handed out before `other`. Only jobs in the
    /// same ready, delayed or buried state can be ordered.
    pub(crate) fn precedes(&self, other: &Job) -> Result<bool> {
        match (&self.state, &other.state) {
            (JobState::Ready, JobState::Ready) => Ok((
                self.pri,
                self.created,
                self.id,
            ) < (other.pri, other.created, other.id)),
            (JobState::Delayed, JobState::Delayed) => {
                Ok((self.ready_at, self.id) < (other.ready_at, other.id))
            },
            (JobState::Buried, JobState::Buried) => {
                Ok((self.buried_at, self.id) < (other.buried_at, other.id))
            },
            _ => Err(BrokerError::IncomparableJobs {
                left: self.id,
                left_state: self.status(),
                right: other.id,
                right_state: other.status(),
            }),
        }
    }

    pub(crate) fn stats(&self, now: Instant) -> JobStats {
        let time_left = match &self.state {
            JobState::Reserved(r) | JobState::DeadlinePending(r) => {
                r.timeout_at.saturating_duration_since(now)
            },
            JobState::Delayed => self.ready_at.saturating_duration_since(now),
            _ => Duration::ZERO,
        };

        JobStats {
            id: self.id,
            tube: self.tube.clone(),
            state: self.status(),
            pri: self.pri,
            age: now.saturating_duration_since(self.created).as_secs(),
            delay: self.delay,
            ttr: self.ttr,
            time_left: time_left.as_secs(),
            file: 0,
            reserves: self.counters.reserves,
            timeouts: self.counters.timeouts,
            releases: self.counters.releases,
            buries: self.counters.buries,
            kicks: self.counters.kicks,
        }
    }
}

fn secs(n: u32) -> Duration {
    Duration::from_secs(n.into())
}

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::BrokerState;
use crate::connection::ConnectionId;
use crate::error::{BrokerError, Result};
use crate::tube::Purpose;
use crate::types::job::JobId;
use crate::types::protocol::BeanstalkResponse;
use crate::types::states::JobStatus;

impl BrokerState {
    /// `reserve` and `reserve-with-timeout`. Without a timeout the client
    /// waits indefinitely; with a zero timeout exactly one attempt is made.
    /// When no job can be handed over straight away the reply comes later,
    /// from a dispatch or from the sweep.
    pub(super) fn reserve(
        &mut self,
        id: ConnectionId,
        timeout: Option<u32>,
        now: Instant,
    ) -> Result<Option<BeanstalkResponse>> {
        self.connection(id)?.worker = true;

        if self.has_deadline_pending(id, now) {
            return Ok(Some(BeanstalkResponse::DeadlineSoon));
        }

        let conn = self.connection(id)?;
        let deadline = timeout
            .filter(|&t| t > 0)
            .map(|t| now + Duration::from_secs(t.into()));
        if !conn.wait(deadline) {
            return Err(BrokerError::CannotWait(id));
        }

        let watched = conn.tubes_watched().to_vec();
        for name in &watched {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.reserve(id);
            }
        }

        if let Some(job) = self.next_job_for(&watched, now)? {
            if self.try_dispatch(id, job, now)? {
                return Ok(None);
            }
        }

        if timeout == Some(0) {
            self.cancel_reservations(id);
            self.connection(id)?.wait_timed_out();
            return Ok(Some(BeanstalkResponse::TimedOut));
        }

        trace!(connection = id, ?deadline, "waiting for a job");
        Ok(None)
    }

    /// The best ready job across the given tubes.
    fn next_job_for(
        &mut self,
        tubes: &[String],
        now: Instant,
    ) -> Result<Option<JobId>> {
        let mut best: Option<JobId> = None;

        for name in tubes {
            let Some(tube) = self.tubes.get_mut(name) else {
                continue;
            };
            let Some(candidate) = tube.next_job(
                &mut self.jobs,
                JobStatus::Ready,
                Purpose::Reserve,
                now,
            )?
            else {
                continue;
            };

            best = Some(match best {
                None => candidate,
                Some(current) => {
                    let a = self
                        .jobs
                        .get(candidate)
                        .ok_or(BrokerError::MissingJob(candidate))?;
                    let b = self
                        .jobs
                        .get(current)
                        .ok_or(BrokerError::MissingJob(current))?;

                    if a.precedes(b)? {
                        candidate
                    } else {
                        current
                    }
                },
            });
        }

        Ok(best)
    }

    /// Hands a job to a connection, provided the connection is still waiting
    /// and the job can still be claimed. On success the job is sent and the
    /// connection stops waiting on all of its tubes.
    pub(super) fn try_dispatch(
        &mut self,
        id: ConnectionId,
        job_id: JobId,
        now: Instant,
    ) -> Result<bool> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(false);
        };
        if !conn.is_waiting(now) {
            return Ok(false);
        }

        let job = self
            .jobs
            .reconciled(job_id, now)
            .ok_or(BrokerError::MissingJob(job_id))?;
        if !job.reserve(id, now) {
            return Ok(false);
        }

        conn.transmit(&BeanstalkResponse::Reserved {
            id: job_id,
            data: job.data.clone(),
        });
        debug!(connection = id, job = job_id, "reserved job");

        self.cancel_reservations(id);
        let held = self.reserved.entry(id).or_default();
        if !held.contains(&job_id) {
            held.push(job_id);
        }
        Ok(true)
    }

    /// Offers a tube's ready jobs to its waiting connections, oldest waiter
    /// first, until one or the other runs out.
    pub(super) fn honor_reservations(
        &mut self,
        tube_name: &str,
        now: Instant,
    ) -> Result<()> {
        loop {
            let Some(tube) = self.tubes.get_mut(tube_name) else {
                return Ok(());
            };
            let Some(job) = tube.next_job(
                &mut self.jobs,
                JobStatus::Ready,
                Purpose::Reserve,
                now,
            )?
            else {
                return Ok(());
            };

            let connections = &mut self.connections;
            let Some(waiter) = tube.next_reservation(|c| {
                connections
                    .get_mut(&c)
                    .is_some_and(|conn| conn.is_waiting(now))
            }) else {
                return Ok(());
            };

            if !self.try_dispatch(waiter, job, now)? {
                // Drop the waiter so this can't loop forever.
                if let Some(tube) = self.tubes.get_mut(tube_name) {
                    tube.cancel_reservation(waiter);
                }
            }
        }
    }

    /// Removes a connection from the waiters of every tube it watches.
    pub(super) fn cancel_reservations(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };

        for name in conn.tubes_watched() {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.cancel_reservation(id);
            }
        }
    }

    /// Whether any job the connection holds is about to time out.
    pub(super) fn has_deadline_pending(
        &mut self,
        id: ConnectionId,
        now: Instant,
    ) -> bool {
        let Some(held) = self.reserved.get(&id) else {
            return false;
        };

        held.iter().any(|&job| {
            self.jobs
                .reconciled(job, now)
                .is_some_and(|job| job.status() == JobStatus::DeadlinePending)
        })
    }
}

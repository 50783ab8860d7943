use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::ConnectionId;
use crate::error::{BrokerError, Result};
use crate::jobs::JobTable;
use crate::types::job::JobId;
use crate::types::protocol::TubeStats;
use crate::types::states::JobStatus;

/// The tube every connection starts out using and watching. It is never
/// reaped.
pub(crate) const DEFAULT_TUBE: &str = "default";

/// Why a job is being looked for. Paused tubes still allow peeking.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Purpose {
    Reserve,
    Peek,
}

#[derive(Clone, Copy, Debug)]
struct Pause {
    resume_at: Instant,
    delay: u32,
}

/// A named queue: the IDs of its jobs, the connections waiting to reserve
/// from it, and its pause state.
#[derive(Debug)]
pub(crate) struct Tube {
    pub(crate) name: String,
    /// Unordered; ordering is worked out when scanning.
    jobs: Vec<JobId>,
    /// Connections that asked to reserve from this tube, oldest first. May
    /// hold connections that have since stopped waiting.
    waiters: VecDeque<ConnectionId>,
    pause: Option<Pause>,
    using: u64,
    watching: u64,
    total_jobs: u64,
    cmd_delete: u64,
    cmd_pause_tube: u64,
}

impl Tube {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            jobs: Vec::new(),
            waiters: VecDeque::new(),
            pause: None,
            using: 0,
            watching: 0,
            total_jobs: 0,
            cmd_delete: 0,
            cmd_pause_tube: 0,
        }
    }

    pub(crate) fn put(&mut self, id: JobId) {
        self.jobs.push(id);
        self.total_jobs += 1;
    }

    /// Finds the job in `status` that should be handed out first, if any.
    /// Nothing is returned for reservation while the tube is paused.
    pub(crate) fn next_job(
        &mut self,
        table: &mut JobTable,
        status: JobStatus,
        purpose: Purpose,
        now: Instant,
    ) -> Result<Option<JobId>> {
        if purpose == Purpose::Reserve && self.is_paused(now) {
            return Ok(None);
        }

        let mut best: Option<JobId> = None;
        for &id in &self.jobs {
            let candidate = table
                .reconciled(id, now)
                .ok_or(BrokerError::MissingJob(id))?;
            if candidate.status() != status {
                continue;
            }

            best = Some(match best {
                None => id,
                Some(current) => {
                    let candidate =
                        table.get(id).ok_or(BrokerError::MissingJob(id))?;
                    let incumbent = table
                        .get(current)
                        .ok_or(BrokerError::MissingJob(current))?;

                    if candidate.precedes(incumbent)? {
                        id
                    } else {
                        current
                    }
                },
            });
        }

        Ok(best)
    }

    /// Up to `bound` jobs in `status`, best first.
    pub(crate) fn best_jobs(
        &mut self,
        table: &mut JobTable,
        status: JobStatus,
        bound: u64,
        now: Instant,
    ) -> Result<Vec<JobId>> {
        let mut found = Vec::new();
        for &id in &self.jobs {
            let job = table
                .reconciled(id, now)
                .ok_or(BrokerError::MissingJob(id))?;
            if job.status() == status {
                found.push(id);
            }
        }

        // Insertion sort with the fallible ordering.
        let mut sorted: Vec<JobId> = Vec::with_capacity(found.len());
        for id in found {
            let job = table.get(id).ok_or(BrokerError::MissingJob(id))?;
            let mut at = sorted.len();
            while at > 0 {
                let before = table
                    .get(sorted[at - 1])
                    .ok_or(BrokerError::MissingJob(sorted[at - 1]))?;
                if !job.precedes(before)? {
                    break;
                }
                at -= 1;
            }
            sorted.insert(at, id);
        }

        sorted.truncate(usize::try_from(bound).unwrap_or(usize::MAX));
        Ok(sorted)
    }

    /// Removes a deleted job from the index.
    pub(crate) fn delete(&mut self, id: JobId) {
        self.jobs.retain(|&j| j != id);
        self.cmd_delete += 1;
    }

    /// Queues a connection for the next job to become available.
    pub(crate) fn reserve(&mut self, conn: ConnectionId) {
        if !self.waiters.contains(&conn) {
            self.waiters.push_back(conn);
        }
    }

    /// The longest-waiting connection that is still waiting. Connections
    /// that have stopped waiting are dropped from the queue on the way.
    pub(crate) fn next_reservation(
        &mut self,
        mut is_waiting: impl FnMut(ConnectionId) -> bool,
    ) -> Option<ConnectionId> {
        while let Some(&conn) = self.waiters.front() {
            if is_waiting(conn) {
                return Some(conn);
            }
            self.waiters.pop_front();
        }

        None
    }

    pub(crate) fn cancel_reservation(&mut self, conn: ConnectionId) {
        self.waiters.retain(|&c| c != conn);
    }

    pub(crate) fn waiters(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.waiters.iter().copied()
    }

    /// Pauses the tube for `delay` seconds. An already paused tube is left
    /// as it is and false is returned.
    pub(crate) fn pause(&mut self, delay: u32, now: Instant) -> bool {
        if self.is_paused(now) {
            return false;
        }

        self.pause = Some(Pause {
            resume_at: now + Duration::from_secs(delay.into()),
            delay,
        });
        self.cmd_pause_tube += 1;
        true
    }

    /// Whether the tube is paused at `now`. An elapsed pause is cleared.
    pub(crate) fn is_paused(&mut self, now: Instant) -> bool {
        match self.pause {
            Some(pause) if pause.resume_at > now => true,
            Some(_) => {
                self.pause = None;
                false
            },
            None => false,
        }
    }

    pub(crate) fn use_tube(&mut self) {
        self.using += 1;
    }

    pub(crate) fn stop_use(&mut self) {
        self.using = self.using.saturating_sub(1);
    }

    pub(crate) fn watch(&mut self) {
        self.watching += 1;
    }

    pub(crate) fn ignore(&mut self) {
        self.watching = self.watching.saturating_sub(1);
    }

    /// Whether the tube has a reason to exist.
    pub(crate) fn is_active(&self) -> bool {
        self.name == DEFAULT_TUBE
            || !self.jobs.is_empty()
            || self.using > 0
            || self.watching > 0
    }

    /// `waiting` is the number of connections blocked on this tube, which
    /// only the broker can tell.
    pub(crate) fn stats(
        &mut self,
        table: &mut JobTable,
        waiting: u64,
        now: Instant,
    ) -> TubeStats {
        let counts = table.counts_by_state(self.jobs.iter().copied(), now);
        let paused = self.is_paused(now);
        let (pause, pause_time_left) = match self.pause {
            Some(p) if paused => {
                (p.delay, p.resume_at.saturating_duration_since(now).as_secs())
            },
            _ => (0, 0),
        };

        TubeStats {
            name: self.name.clone(),
            current_jobs_urgent: counts.urgent,
            current_jobs_ready: counts.ready,
            current_jobs_reserved: counts.reserved,
            current_jobs_delayed: counts.delayed,
            current_jobs_buried: counts.buried,
            total_jobs: self.total_jobs,
            current_using: self.using,
            current_watching: self.watching,
            current_waiting: waiting,
            cmd_delete: self.cmd_delete,
            cmd_pause_tube: self.cmd_pause_tube,
            pause,
            pause_time_left,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::Job;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn put(
        tube: &mut Tube,
        table: &mut JobTable,
        pri: u32,
        delay: u32,
        now: Instant,
    ) -> JobId {
        let name = tube.name.clone();
        let id = table.insert_with(|id| {
            Job::new(id, name, pri, delay, 60, "x".into(), now)
        });
        tube.put(id);
        id
    }

    #[test]
    fn test_next_job_orders_by_priority_then_age() {
        let now = Instant::now();
        let mut table = JobTable::default();
        let mut tube = Tube::new("default");

        put(&mut tube, &mut table, 5, 0, now);
        let urgent = put(&mut tube, &mut table, 1, 0, now + secs(1));
        put(&mut tube, &mut table, 1, 0, now + secs(2));

        assert_eq!(
            tube.next_job(
                &mut table,
                JobStatus::Ready,
                Purpose::Reserve,
                now + secs(2)
            )
            .unwrap(),
            Some(urgent)
        );
    }

    #[test]
    fn test_next_delayed() {
        let now = Instant::now();
        let mut table = JobTable::default();
        let mut tube = Tube::new("default");

        put(&mut tube, &mut table, 0, 10, now);
        let soonest = put(&mut tube, &mut table, 0, 3, now);
        put(&mut tube, &mut table, 0, 0, now);

        assert_eq!(
            tube.next_job(&mut table, JobStatus::Delayed, Purpose::Peek, now)
                .unwrap(),
            Some(soonest)
        );
        assert_eq!(
            tube.best_jobs(&mut table, JobStatus::Delayed, 5, now).unwrap(),
            [2, 1]
        );
        assert_eq!(
            tube.best_jobs(&mut table, JobStatus::Delayed, 1, now).unwrap(),
            [2]
        );
    }

    #[test]
    fn test_paused_tube_refuses_reservations() {
        let now = Instant::now();
        let mut table = JobTable::default();
        let mut tube = Tube::new("emails");
        let id = put(&mut tube, &mut table, 0, 0, now);

        assert!(tube.pause(2, now));
        assert!(!tube.pause(5, now));

        fn next(
            tube: &mut Tube,
            table: &mut JobTable,
            purpose: Purpose,
            at: Instant,
        ) -> Option<JobId> {
            tube.next_job(table, JobStatus::Ready, purpose, at).unwrap()
        }
        assert_eq!(next(&mut tube, &mut table, Purpose::Reserve, now), None);
        assert_eq!(
            next(&mut tube, &mut table, Purpose::Peek, now),
            Some(id)
        );

        let stats = tube.stats(&mut table, 0, now + secs(1));
        assert_eq!(stats.pause, 2);
        assert_eq!(stats.pause_time_left, 1);
        assert_eq!(stats.cmd_pause_tube, 1);

        assert_eq!(
            next(&mut tube, &mut table, Purpose::Reserve, now + secs(2)),
            Some(id)
        );
        assert!(!tube.is_paused(now + secs(2)));
    }

    #[test]
    fn test_waiters() {
        let mut tube = Tube::new("default");
        tube.reserve(1);
        tube.reserve(2);
        tube.reserve(3);
        tube.reserve(2);

        // 1 stopped waiting.
        assert_eq!(tube.next_reservation(|c| c != 1), Some(2));
        assert_eq!(tube.waiters().collect::<Vec<_>>(), [2, 3]);

        tube.cancel_reservation(2);
        assert_eq!(tube.next_reservation(|_| true), Some(3));
        assert_eq!(tube.next_reservation(|_| false), None);
        assert_eq!(tube.waiters().count(), 0);
    }

    #[test]
    fn test_activity() {
        let now = Instant::now();
        let mut table = JobTable::default();

        assert!(Tube::new("default").is_active());

        let mut tube = Tube::new("emails");
        assert!(!tube.is_active());

        tube.watch();
        assert!(tube.is_active());
        tube.ignore();
        tube.use_tube();
        assert!(tube.is_active());
        tube.stop_use();
        assert!(!tube.is_active());

        let id = put(&mut tube, &mut table, 0, 0, now);
        assert!(tube.is_active());
        tube.delete(id);
        assert!(!tube.is_active());

        let stats = tube.stats(&mut table, 0, now);
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.cmd_delete, 1);
    }

    #[test]
    fn test_mixed_states_are_skipped() {
        let now = Instant::now();
        let mut table = JobTable::default();
        let mut tube = Tube::new("default");

        let first = put(&mut tube, &mut table, 0, 0, now);
        let second = put(&mut tube, &mut table, 0, 0, now);
        assert!(table.reconciled(first, now).unwrap().reserve(9, now));

        assert_eq!(
            tube.next_job(&mut table, JobStatus::Ready, Purpose::Reserve, now)
                .unwrap(),
            Some(second)
        );
        assert_eq!(
            tube.next_job(&mut table, JobStatus::Buried, Purpose::Peek, now)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_dangling_index_entry() {
        let now = Instant::now();
        let mut table = JobTable::default();
        let mut tube = Tube::new("default");
        tube.put(42);

        assert!(matches!(
            tube.next_job(&mut table, JobStatus::Ready, Purpose::Peek, now),
            Err(BrokerError::MissingJob(42))
        ));
    }
}

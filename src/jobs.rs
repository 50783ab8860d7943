use tokio::time::Instant;

use crate::types::job::{Job, JobId, Timeout, URGENT_PRIORITY};
use crate::types::protocol::StateCounts;
use crate::types::states::JobStatus;

/// Every job ever created, indexed by ID. IDs start at 1 and are handed out
/// in insertion order; a deleted job leaves an empty slot so its ID is never
/// reused.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    slots: Vec<Option<Job>>,
    /// Reservations found to have lapsed during reconciliation, awaiting
    /// [`JobTable::take_timeouts`].
    timeouts: Vec<Timeout>,
}

impl JobTable {
    /// Creates a job with the next ID.
    pub(crate) fn insert_with(
        &mut self,
        make: impl FnOnce(JobId) -> Job,
    ) -> JobId {
        let id = self.slots.len() as JobId + 1;
        self.slots.push(Some(make(id)));
        id
    }

    fn slot(&self, id: JobId) -> Option<&Job> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.slots.get(index)?.as_ref()
    }

    /// Looks up a job without reconciling it. Only for jobs that were
    /// reconciled at the current instant already.
    pub(crate) fn get(&self, id: JobId) -> Option<&Job> {
        self.slot(id)
            .filter(|job| job.status() != JobStatus::Deleted)
    }

    /// Looks up a job, first applying any time-based transitions due at
    /// `now`. Unknown and deleted jobs are not found.
    pub(crate) fn reconciled(
        &mut self,
        id: JobId,
        now: Instant,
    ) -> Option<&mut Job> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        let job = self.slots.get_mut(index)?.as_mut()?;

        if let Some(timeout) = job.reconcile(now) {
            self.timeouts.push(timeout);
        }
        if job.status() == JobStatus::Deleted {
            return None;
        }

        Some(job)
    }

    /// Frees a job's slot. The ID stays spent.
    pub(crate) fn remove(&mut self, id: JobId) -> Option<Job> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.slots.get_mut(index)?.take()
    }

    /// Count of jobs ever created.
    pub(crate) fn total_jobs(&self) -> u64 {
        self.slots.len() as u64
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(|job| job.id)
    }

    /// Counts the given jobs by state as of `now`. IDs that aren't found are
    /// skipped.
    pub(crate) fn counts_by_state(
        &mut self,
        ids: impl IntoIterator<Item = JobId>,
        now: Instant,
    ) -> StateCounts {
        let mut counts = StateCounts::default();

        for id in ids {
            let Some(job) = self.reconciled(id, now) else {
                continue;
            };

            let status = job.status();
            match status {
                JobStatus::Ready => {
                    counts.ready += 1;
                    if job.pri < URGENT_PRIORITY {
                        counts.urgent += 1;
                    }
                },
                _ if status.is_reserved() => counts.reserved += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Buried => counts.buried += 1,
                _ => {},
            }
        }

        counts
    }

    /// Drains the reservations that lapsed since the last call.
    pub(crate) fn take_timeouts(&mut self) -> Vec<Timeout> {
        std::mem::take(&mut self.timeouts)
    }
}

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error};

use super::{tube_entry, BrokerState};
use crate::connection::{ConnectionId, LastWatchedTube, PendingPut};
use crate::error::Result;
use crate::tube::Purpose;
use crate::types::job::{Job, JobId};
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::states::JobStatus;

impl BrokerState {
    /// Runs a parsed command for a connection. `None` means the reply will
    /// be sent later.
    pub(super) fn run(
        &mut self,
        id: ConnectionId,
        cmd: BeanstalkCommand,
        now: Instant,
    ) -> Result<Option<BeanstalkResponse>> {
        use BeanstalkCommand::*;

        let response = match cmd {
            Reserve => return self.reserve(id, None, now),
            ReserveWithTimeout { timeout } => {
                return self.reserve(id, Some(timeout), now)
            },
            // Both are dealt with before getting here.
            Put { .. } | Quit => BeanstalkResponse::InternalError,
            Release { id: job, pri, delay } => {
                self.release(id, job, pri, delay, now)?
            },
            Delete { id: job } => self.delete(id, job, now),
            Bury { id: job, pri } => self.bury(id, job, pri, now),
            Touch { id: job } => self.touch(id, job, now),
            Watch { tube } => self.watch(id, &tube)?,
            Ignore { tube } => self.ignore(id, &tube)?,
            Use { tube } => self.use_tube(id, &tube)?,
            Peek { id: job } => self.peek(job, now),
            PeekReady => self.peek_by_state(id, JobStatus::Ready, now)?,
            PeekDelayed => self.peek_by_state(id, JobStatus::Delayed, now)?,
            PeekBuried => self.peek_by_state(id, JobStatus::Buried, now)?,
            Kick { bound } => self.kick(id, bound, now)?,
            KickJob { id: job } => self.kick_job(job, now)?,
            PauseTube { tube, delay } => self.pause_tube(&tube, delay, now),
            StatsJob { id: job } => self.stats_job(job, now)?,
            StatsTube { tube } => self.stats_tube(&tube, now)?,
            StatsServer => self.stats_server(now)?,
            ListTubes => self.list_tubes()?,
            ListTubeUsed => BeanstalkResponse::Using {
                tube: self.connection(id)?.tube_used().to_string(),
            },
            ListTubesWatched => {
                BeanstalkResponse::yaml(self.connection(id)?.tubes_watched())?
            },
        };

        Ok(Some(response))
    }

    pub(super) fn put(
        &mut self,
        id: ConnectionId,
        put: PendingPut,
        mut body: Bytes,
        now: Instant,
    ) -> Result<Option<BeanstalkResponse>> {
        if put.n_bytes > self.config.max_job_size {
            return Ok(Some(BeanstalkResponse::JobTooBig));
        }

        let n_bytes = put.n_bytes as usize;
        if body.len() != n_bytes + 2 || !body.ends_with(b"\r\n") {
            return Ok(Some(BeanstalkResponse::ExpectedCRLF));
        }
        body.truncate(n_bytes);

        let conn = self.connection(id)?;
        conn.producer = true;
        let tube = conn.tube_used().to_string();

        let job = self.jobs.insert_with(|job| {
            Job::new(job, tube.clone(), put.pri, put.delay, put.ttr, body, now)
        });
        tube_entry(&mut self.tubes, &tube).put(job);
        debug!(connection = id, job, %tube, "inserted job");

        // The job exists now whatever happens next.
        self.connection(id)?
            .transmit(&BeanstalkResponse::Inserted { id: job });

        if put.delay > 0 {
            self.delayed.insert(job);
        } else if let Err(error) = self.honor_reservations(&tube, now) {
            error!(%tube, job, %error, "failed to hand out new job");
        }

        Ok(None)
    }

    fn release(
        &mut self,
        id: ConnectionId,
        job_id: JobId,
        pri: u32,
        delay: u32,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        let Some(job) = self.jobs.reconciled(job_id, now) else {
            return Ok(BeanstalkResponse::NotFound);
        };
        if !job.release(id, pri, delay, true, now) {
            return Ok(BeanstalkResponse::NotFound);
        }
        let tube = job.tube.clone();

        self.forget_reservation(id, job_id);
        if delay > 0 {
            self.delayed.insert(job_id);
        } else {
            self.honor_reservations(&tube, now)?;
        }

        Ok(BeanstalkResponse::Released)
    }

    fn delete(
        &mut self,
        id: ConnectionId,
        job_id: JobId,
        now: Instant,
    ) -> BeanstalkResponse {
        let Some(job) = self.jobs.reconciled(job_id, now) else {
            return BeanstalkResponse::NotFound;
        };
        if !job.delete(id) {
            return BeanstalkResponse::NotFound;
        }
        let tube = job.tube.clone();

        self.jobs.remove(job_id);
        if let Some(t) = self.tubes.get_mut(&tube) {
            t.delete(job_id);
        }
        self.delayed.remove(&job_id);
        self.forget_reservation(id, job_id);
        self.reap_tube(&tube);

        debug!(connection = id, job = job_id, "deleted job");
        BeanstalkResponse::Deleted
    }

    fn bury(
        &mut self,
        id: ConnectionId,
        job_id: JobId,
        pri: u32,
        now: Instant,
    ) -> BeanstalkResponse {
        let buried = self
            .jobs
            .reconciled(job_id, now)
            .is_some_and(|job| job.bury(id, pri, now));
        if !buried {
            return BeanstalkResponse::NotFound;
        }

        self.forget_reservation(id, job_id);
        BeanstalkResponse::Buried
    }

    fn touch(
        &mut self,
        id: ConnectionId,
        job_id: JobId,
        now: Instant,
    ) -> BeanstalkResponse {
        let touched = self
            .jobs
            .reconciled(job_id, now)
            .is_some_and(|job| job.touch(id, now));

        if touched {
            BeanstalkResponse::Touched
        } else {
            BeanstalkResponse::NotFound
        }
    }

    fn watch(
        &mut self,
        id: ConnectionId,
        tube: &str,
    ) -> Result<BeanstalkResponse> {
        let conn = self.connection(id)?;
        let added = conn.watch(tube);
        let count = conn.tubes_watched().len();

        if added {
            tube_entry(&mut self.tubes, tube).watch();
        }

        Ok(BeanstalkResponse::Watching { count })
    }

    fn ignore(
        &mut self,
        id: ConnectionId,
        tube: &str,
    ) -> Result<BeanstalkResponse> {
        let conn = self.connection(id)?;
        if !conn.is_watching(tube) {
            return Ok(BeanstalkResponse::Watching {
                count: conn.tubes_watched().len(),
            });
        }
        if let Err(LastWatchedTube) = conn.ignore(tube) {
            return Ok(BeanstalkResponse::NotIgnored);
        }
        let count = conn.tubes_watched().len();

        if let Some(t) = self.tubes.get_mut(tube) {
            t.ignore();
        }
        self.reap_tube(tube);

        Ok(BeanstalkResponse::Watching { count })
    }

    fn use_tube(
        &mut self,
        id: ConnectionId,
        tube: &str,
    ) -> Result<BeanstalkResponse> {
        let conn = self.connection(id)?;
        let previous = conn.tube_used().to_string();

        if previous != tube {
            conn.use_tube(tube);
            tube_entry(&mut self.tubes, tube).use_tube();
            if let Some(t) = self.tubes.get_mut(&previous) {
                t.stop_use();
            }
            self.reap_tube(&previous);
        }

        Ok(BeanstalkResponse::Using {
            tube: tube.to_string(),
        })
    }

    fn peek(&mut self, job_id: JobId, now: Instant) -> BeanstalkResponse {
        match self.jobs.reconciled(job_id, now) {
            Some(job) => BeanstalkResponse::Found {
                id: job.id,
                data: job.data.clone(),
            },
            None => BeanstalkResponse::NotFound,
        }
    }

    /// `peek-ready`, `peek-delayed` and `peek-buried` on the used tube.
    fn peek_by_state(
        &mut self,
        id: ConnectionId,
        status: JobStatus,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        let name = self.connection(id)?.tube_used().to_string();
        let Some(tube) = self.tubes.get_mut(&name) else {
            return Ok(BeanstalkResponse::NotFound);
        };

        let found =
            tube.next_job(&mut self.jobs, status, Purpose::Peek, now)?;
        Ok(match found.and_then(|job| self.jobs.get(job)) {
            Some(job) => BeanstalkResponse::Found {
                id: job.id,
                data: job.data.clone(),
            },
            None => BeanstalkResponse::NotFound,
        })
    }

    /// Kicks up to `bound` buried jobs on the used tube, or if there are
    /// none, up to `bound` delayed jobs.
    fn kick(
        &mut self,
        id: ConnectionId,
        bound: u64,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        let name = self.connection(id)?.tube_used().to_string();
        let Some(tube) = self.tubes.get_mut(&name) else {
            return Ok(BeanstalkResponse::KickedCount { count: 0 });
        };

        let mut candidates =
            tube.best_jobs(&mut self.jobs, JobStatus::Buried, bound, now)?;
        if candidates.is_empty() {
            candidates =
                tube.best_jobs(&mut self.jobs, JobStatus::Delayed, bound, now)?;
        }

        let mut count = 0;
        for job_id in candidates {
            if self
                .jobs
                .reconciled(job_id, now)
                .is_some_and(|job| job.kick(now))
            {
                self.delayed.remove(&job_id);
                count += 1;
            }
        }

        if count > 0 {
            self.honor_reservations(&name, now)?;
        }

        Ok(BeanstalkResponse::KickedCount { count })
    }

    fn kick_job(
        &mut self,
        job_id: JobId,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        let Some(job) = self.jobs.reconciled(job_id, now) else {
            return Ok(BeanstalkResponse::NotFound);
        };
        if !job.kick(now) {
            return Ok(BeanstalkResponse::NotFound);
        }
        let tube = job.tube.clone();

        self.delayed.remove(&job_id);
        self.honor_reservations(&tube, now)?;
        Ok(BeanstalkResponse::Kicked)
    }

    fn pause_tube(
        &mut self,
        name: &str,
        delay: u32,
        now: Instant,
    ) -> BeanstalkResponse {
        let Some(tube) = self.tubes.get_mut(name) else {
            return BeanstalkResponse::NotFound;
        };

        if tube.pause(delay, now) {
            debug!(tube = name, delay, "paused tube");
            self.paused.insert(name.to_string());
        }

        BeanstalkResponse::Paused
    }
}

use tokio::time::Instant;

use super::BrokerState;
use crate::error::Result;
use crate::types::job::JobId;
use crate::types::protocol::{BeanstalkResponse, ServerStats};

/// Reported as the binlog size limit, as beanstalkd does with no binlog.
const BINLOG_MAX_SIZE: u64 = 10_485_760;

impl BrokerState {
    pub(super) fn stats_job(
        &mut self,
        job_id: JobId,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        match self.jobs.reconciled(job_id, now) {
            Some(job) => BeanstalkResponse::yaml(&job.stats(now)),
            None => Ok(BeanstalkResponse::NotFound),
        }
    }

    pub(super) fn stats_tube(
        &mut self,
        name: &str,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        let Some(tube) = self.tubes.get_mut(name) else {
            return Ok(BeanstalkResponse::NotFound);
        };

        let connections = &mut self.connections;
        let waiting = tube
            .waiters()
            .filter(|c| {
                connections
                    .get_mut(c)
                    .is_some_and(|conn| conn.is_waiting(now))
            })
            .count() as u64;

        BeanstalkResponse::yaml(&tube.stats(&mut self.jobs, waiting, now))
    }

    pub(super) fn stats_server(
        &mut self,
        now: Instant,
    ) -> Result<BeanstalkResponse> {
        let ids: Vec<JobId> = self.jobs.ids().collect();
        let counts = self.jobs.counts_by_state(ids, now);

        let (mut producers, mut workers, mut waiting) = (0, 0, 0);
        for conn in self.connections.values_mut() {
            producers += u64::from(conn.producer);
            workers += u64::from(conn.worker);
            waiting += u64::from(conn.is_waiting(now));
        }

        let cmd = |verb: &str| self.cmd_counts.get(verb).copied().unwrap_or(0);

        let stats = ServerStats {
            current_jobs_urgent: counts.urgent,
            current_jobs_ready: counts.ready,
            current_jobs_reserved: counts.reserved,
            current_jobs_delayed: counts.delayed,
            current_jobs_buried: counts.buried,
            cmd_put: cmd("put"),
            cmd_peek: cmd("peek"),
            cmd_peek_ready: cmd("peek-ready"),
            cmd_peek_delayed: cmd("peek-delayed"),
            cmd_peek_buried: cmd("peek-buried"),
            cmd_reserve: cmd("reserve"),
            cmd_reserve_with_timeout: cmd("reserve-with-timeout"),
            cmd_delete: cmd("delete"),
            cmd_release: cmd("release"),
            cmd_use: cmd("use"),
            cmd_watch: cmd("watch"),
            cmd_ignore: cmd("ignore"),
            cmd_bury: cmd("bury"),
            cmd_kick: cmd("kick"),
            cmd_touch: cmd("touch"),
            cmd_stats: cmd("stats"),
            cmd_stats_job: cmd("stats-job"),
            cmd_stats_tube: cmd("stats-tube"),
            cmd_list_tubes: cmd("list-tubes"),
            cmd_list_tube_used: cmd("list-tube-used"),
            cmd_list_tubes_watched: cmd("list-tubes-watched"),
            cmd_pause_tube: cmd("pause-tube"),
            job_timeouts: self.job_timeouts,
            total_jobs: self.jobs.total_jobs(),
            max_job_size: self.config.max_job_size,
            current_tubes: self.tubes.len() as u64,
            current_connections: self.connections.len() as u64,
            current_producers: producers,
            current_workers: workers,
            current_waiting: waiting,
            total_connections: self.total_connections,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            uptime: now.saturating_duration_since(self.started_at).as_secs(),
            binlog_oldest_index: 0,
            binlog_current_index: 0,
            binlog_records_written: 0,
            binlog_records_migrated: 0,
            binlog_max_size: BINLOG_MAX_SIZE,
            id: self.instance_id.clone(),
            hostname: self.config.hostname.clone(),
        };

        BeanstalkResponse::yaml(&stats)
    }

    pub(super) fn list_tubes(&self) -> Result<BeanstalkResponse> {
        let names: Vec<&str> = self
            .tubes
            .values()
            .filter(|tube| tube.is_active())
            .map(|tube| tube.name.as_str())
            .collect();

        BeanstalkResponse::yaml(&names)
    }
}

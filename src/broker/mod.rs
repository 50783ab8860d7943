//! The broker: every job, tube and connection, and the commands that act on
//! them.
//!
//! All state sits behind one lock. Each call takes the lock for the whole of
//! a command, so job ID allocation, claiming a job for a waiting connection,
//! and scans over a tube never interleave with one another.
mod commands;
mod dispatch;
mod stats;


use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::config::BrokerConfig;
use crate::connection::{ConnectionState, PendingPut};
pub use crate::connection::{ConnectionId, Outbound};
use crate::error::{BrokerError, Result};
use crate::jobs::JobTable;
use crate::parser::ParsingError;
use crate::tube::{Tube, DEFAULT_TUBE};
use crate::types::job::JobId;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::states::JobStatus;
use crate::util::bytes_to_human_str;

/// What the transport should do once the broker has seen its input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// Exactly one reply is, or will be, sent on the outbound channel. It may
    /// be a while coming if the client is waiting for a job.
    AwaitReply,
    /// A `put` line was accepted: `n_bytes` of body plus a CRLF follow on the
    /// wire, and must be passed to [`Broker::supply_body`]. If `discard` is
    /// set, the body is too large to accept and an empty one should be
    /// supplied after skipping it.
    ReadBody { n_bytes: u32, discard: bool },
    /// The input arrived while a request was already in flight and was
    /// dropped.
    Ignored,
    /// The client asked to leave, or is no longer known. Nothing is sent.
    Quit,
}

/// An in-memory beanstalkd-compatible broker, shared between connection
/// tasks and the periodic sweep.
pub struct Broker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Mutex::new(BrokerState::new(config.clone(), Instant::now())),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Registers a client. Replies to its commands are sent to `outbound`.
    pub fn connect(&self, outbound: Outbound) -> ConnectionId {
        self.state.lock().connect(outbound)
    }

    /// Executes one command line, without its trailing CRLF.
    pub fn execute(&self, conn: ConnectionId, line: &[u8]) -> Step {
        let now = Instant::now();
        let mut state = self.state.lock();
        let step = state.execute(conn, line, now);
        state.settle(now);
        step
    }

    /// Completes a `put` with its body, which must include the CRLF that
    /// followed it on the wire.
    pub fn supply_body(&self, conn: ConnectionId, body: Bytes) -> Step {
        let now = Instant::now();
        let mut state = self.state.lock();
        let step = state.supply_body(conn, body, now);
        state.settle(now);
        step
    }

    /// Forgets a client, releasing any jobs it holds. Safe to call more than
    /// once.
    pub fn disconnect(&self, conn: ConnectionId) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.disconnect(conn, now);
        state.settle(now);
    }

    /// Applies time-based changes: wait timeouts, deadline warnings, TTR
    /// expiry, delays maturing and pauses ending. Called periodically.
    pub fn update_state(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.update_state(now);
        state.settle(now);
    }
}

/// Everything the broker tracks. Jobs, tubes and connections refer to one
/// another by ID or name only.
struct BrokerState {
    config: BrokerConfig,
    started_at: Instant,
    /// Random, reported by `stats`.
    instance_id: String,
    jobs: JobTable,
    /// Only active tubes are kept.
    tubes: BTreeMap<String, Tube>,
    connections: HashMap<ConnectionId, ConnectionState>,
    next_connection_id: ConnectionId,
    /// Jobs each connection currently holds reserved.
    reserved: HashMap<ConnectionId, Vec<JobId>>,
    /// Jobs to check on each sweep for their delay ending.
    delayed: BTreeSet<JobId>,
    /// Tubes to check on each sweep for their pause ending.
    paused: BTreeSet<String>,
    cmd_counts: HashMap<&'static str, u64>,
    job_timeouts: u64,
    total_connections: u64,
}

impl BrokerState {
    fn new(config: BrokerConfig, now: Instant) -> Self {
        let mut tubes = BTreeMap::new();
        tubes.insert(DEFAULT_TUBE.to_string(), Tube::new(DEFAULT_TUBE));

        Self {
            config,
            started_at: now,
            instance_id: uuid::Uuid::new_v4().to_string(),
            jobs: JobTable::default(),
            tubes,
            connections: HashMap::new(),
            next_connection_id: 1,
            reserved: HashMap::new(),
            delayed: BTreeSet::new(),
            paused: BTreeSet::new(),
            cmd_counts: HashMap::new(),
            job_timeouts: 0,
            total_connections: 0,
        }
    }

    fn connect(&mut self, outbound: Outbound) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.total_connections += 1;

        let conn = ConnectionState::new(id, outbound);
        for name in conn.tubes_watched() {
            tube_entry(&mut self.tubes, name).watch();
        }
        tube_entry(&mut self.tubes, conn.tube_used()).use_tube();
        self.connections.insert(id, conn);

        debug!(connection = id, "connected");
        id
    }

    fn execute(&mut self, id: ConnectionId, line: &[u8], now: Instant) -> Step {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Step::Quit;
        };
        if !conn.accepts_command(now) {
            debug!(
                connection = id,
                line = bytes_to_human_str(line),
                "ignoring command while a request is in flight"
            );
            return Step::Ignored;
        }

        trace!(
            connection = id,
            line = bytes_to_human_str(line),
            "processing command"
        );

        let cmd: std::result::Result<BeanstalkCommand, ParsingError> =
            line.try_into();
        let cmd = match cmd {
            Ok(cmd) => cmd,
            Err(error) => {
                debug!(connection = id, %error, "rejecting command");
                conn.begin_request();
                conn.transmit(&error.into());
                return Step::AwaitReply;
            },
        };

        if cmd == BeanstalkCommand::Quit {
            self.disconnect(id, now);
            return Step::Quit;
        }

        *self.cmd_counts.entry(cmd.verb()).or_default() += 1;

        if let BeanstalkCommand::Put {
            pri,
            delay,
            ttr,
            n_bytes,
        } = cmd
        {
            conn.begin_multi_part(PendingPut {
                pri,
                delay,
                ttr,
                n_bytes,
            });
            return Step::ReadBody {
                n_bytes,
                discard: n_bytes > self.config.max_job_size,
            };
        }

        conn.begin_request();
        let verb = cmd.verb();
        let result = self.run(id, cmd, now);
        self.reply(id, verb, result);
        Step::AwaitReply
    }

    fn supply_body(
        &mut self,
        id: ConnectionId,
        body: Bytes,
        now: Instant,
    ) -> Step {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Step::Quit;
        };
        let Some(put) = conn.pending_put() else {
            return Step::Ignored;
        };

        conn.begin_request();
        let result = self.put(id, put, body, now);
        self.reply(id, "put", result);
        Step::AwaitReply
    }

    /// Sends a command's reply, if it has one yet. A fault is logged and
    /// reported to the client, unless it already got its reply.
    fn reply(
        &mut self,
        id: ConnectionId,
        verb: &str,
        result: Result<Option<BeanstalkResponse>>,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        match result {
            Ok(Some(response)) => conn.transmit(&response),
            Ok(None) => {},
            Err(error) => {
                error!(connection = id, verb, %error, "internal error");
                if conn.in_request() {
                    conn.transmit(&BeanstalkResponse::InternalError);
                }
            },
        }
    }

    fn connection(&mut self, id: ConnectionId) -> Result<&mut ConnectionState> {
        self.connections
            .get_mut(&id)
            .ok_or(BrokerError::MissingConnection(id))
    }

    /// Drops a job from a connection's list of held jobs.
    fn forget_reservation(&mut self, conn: ConnectionId, job: JobId) {
        if let Some(held) = self.reserved.get_mut(&conn) {
            held.retain(|&j| j != job);
        }
    }

    /// Removes a tube that no longer has jobs, users or watchers.
    fn reap_tube(&mut self, name: &str) {
        if self.tubes.get(name).is_some_and(|tube| !tube.is_active()) {
            self.tubes.remove(name);
            self.paused.remove(name);
            debug!(tube = name, "removed idle tube");
        }
    }

    fn disconnect(&mut self, id: ConnectionId, now: Instant) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        conn.close();

        let mut touched = conn.ignore_all();
        for name in &touched {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.ignore();
                tube.cancel_reservation(id);
            }
        }
        if let Some(tube) = self.tubes.get_mut(conn.tube_used()) {
            tube.stop_use();
        }
        touched.push(conn.tube_used().to_string());

        for job_id in self.reserved.remove(&id).unwrap_or_default() {
            let Some(job) = self.jobs.reconciled(job_id, now) else {
                continue;
            };
            let pri = job.pri;
            if job.release(id, pri, 0, false, now) {
                touched.push(job.tube.clone());
            }
        }

        for name in &touched {
            if let Err(error) = self.honor_reservations(name, now) {
                error!(tube = name, %error, "failed to hand out released jobs");
            }
        }
        for name in &touched {
            self.reap_tube(name);
        }

        debug!(connection = id, "disconnected");
    }

    /// Deals with reservations that lapsed while jobs were being reconciled:
    /// the holder loses the job and it's offered to the tube's waiters.
    fn settle(&mut self, now: Instant) {
        loop {
            let timeouts = self.jobs.take_timeouts();
            if timeouts.is_empty() {
                return;
            }

            for timeout in timeouts {
                debug!(
                    job = timeout.job,
                    connection = timeout.connection,
                    "reservation timed out"
                );
                self.job_timeouts += 1;

                let Some(job) = self.jobs.get(timeout.job) else {
                    self.forget_reservation(timeout.connection, timeout.job);
                    continue;
                };
                // The same holder may have reserved it again since it lapsed.
                if job.is_reserved_by(timeout.connection) {
                    continue;
                }
                let tube = job.tube.clone();
                self.forget_reservation(timeout.connection, timeout.job);
                if let Err(error) = self.honor_reservations(&tube, now) {
                    error!(%tube, %error, "failed to hand out timed out job");
                }
            }
        }
    }

    fn update_state(&mut self, now: Instant) {
        self.update_waiting(now);

        // Reconciling held jobs is what notices their TTR expiring.
        let held: Vec<JobId> =
            self.reserved.values().flatten().copied().collect();
        for id in held {
            self.jobs.reconciled(id, now);
        }

        let delayed: Vec<JobId> = self.delayed.iter().copied().collect();
        for id in delayed {
            let Some(job) = self.jobs.reconciled(id, now) else {
                self.delayed.remove(&id);
                continue;
            };
            match job.status() {
                JobStatus::Delayed => {},
                JobStatus::Ready => {
                    let tube = job.tube.clone();
                    self.delayed.remove(&id);
                    if let Err(error) = self.honor_reservations(&tube, now) {
                        error!(%tube, %error, "failed to hand out delayed job");
                    }
                },
                _ => {
                    self.delayed.remove(&id);
                },
            }
        }

        let paused: Vec<String> = self.paused.iter().cloned().collect();
        for name in paused {
            let still_paused = match self.tubes.get_mut(&name) {
                Some(tube) => tube.is_paused(now),
                None => false,
            };
            if still_paused {
                continue;
            }

            self.paused.remove(&name);
            if let Err(error) = self.honor_reservations(&name, now) {
                error!(tube = name, %error, "failed to resume tube");
            }
        }
    }

    /// Answers waiting connections whose wait has ended without a job: those
    /// whose held jobs are close to their deadline, and those whose
    /// `reserve-with-timeout` ran out.
    fn update_waiting(&mut self, now: Instant) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();

        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            let waiting = conn.is_waiting(now);
            let timed_out = conn.is_timed_out();
            if !waiting && !timed_out {
                continue;
            }

            let response = if waiting && self.has_deadline_pending(id, now) {
                BeanstalkResponse::DeadlineSoon
            } else if timed_out {
                BeanstalkResponse::TimedOut
            } else {
                continue;
            };

            self.cancel_reservations(id);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.transmit(&response);
            }
        }
    }
}

/// Finds a tube, creating it if needed.
fn tube_entry<'a>(
    tubes: &'a mut BTreeMap<String, Tube>,
    name: &str,
) -> &'a mut Tube {
    tubes
        .entry(name.to_string())
        .or_insert_with(|| Tube::new(name))
}

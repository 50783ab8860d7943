use bytes::Bytes;
use serde::Serialize;
use serde_yaml::Value;

use super::job::JobId;
use super::serialisable::BeanstalkSerialisable;
use super::states::JobStatus;
use crate::error::Result;
use crate::parser::ParsingError;

/// A parsed client request. Wire forms are given as `verb <args>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// `put <pri> <delay> <ttr> <bytes>`. The body arrives after the line and
    /// is handed to the broker on its own.
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// `reserve`: block until a ready job shows up on any watched tube.
    Reserve,
    /// `reserve-with-timeout <seconds>`. Zero means try once and give up.
    ReserveWithTimeout { timeout: u32 },
    /// `release <id> <pri> <delay>`
    Release { id: JobId, pri: u32, delay: u32 },
    /// `delete <id>`: works on jobs reserved by the caller, and on any ready,
    /// delayed or buried job.
    Delete { id: JobId },
    /// `bury <id> <pri>`
    Bury { id: JobId, pri: u32 },
    /// `touch <id>`: restart the reservation's TTR countdown.
    Touch { id: JobId },
    /// `watch <tube>`
    Watch { tube: String },
    /// `ignore <tube>`. Refused if it would leave nothing watched.
    Ignore { tube: String },
    /// `peek <id>`, in whatever state the job is.
    Peek { id: JobId },
    /// `peek-ready`
    PeekReady,
    /// `peek-delayed`: the delayed job due soonest.
    PeekDelayed,
    /// `peek-buried`: the job buried longest ago.
    PeekBuried,
    /// `kick <bound>`: kicks buried jobs on the used tube, or only when there
    /// are none, delayed ones.
    Kick { bound: u64 },
    /// `kick-job <id>`
    KickJob { id: JobId },
    /// `stats-job <id>`
    StatsJob { id: JobId },
    /// `stats-tube <tube>`
    StatsTube { tube: String },
    /// `stats`
    StatsServer,
    /// `list-tubes`
    ListTubes,
    /// `list-tube-used`
    ListTubeUsed,
    /// `list-tubes-watched`
    ListTubesWatched,
    /// `quit`: close the connection. No reply is sent.
    Quit,
    /// `pause-tube <tube> <delay>`: hold back reservations from the tube for
    /// `delay` seconds.
    PauseTube { tube: String, delay: u32 },
    /// `use <tube>`
    Use { tube: String },
}

impl BeanstalkCommand {
    /// The command's name on the wire.
    pub fn verb(&self) -> &'static str {
        use BeanstalkCommand::*;

        match self {
            Put { .. } => "put",
            Reserve => "reserve",
            ReserveWithTimeout { .. } => "reserve-with-timeout",
            Release { .. } => "release",
            Delete { .. } => "delete",
            Bury { .. } => "bury",
            Touch { .. } => "touch",
            Watch { .. } => "watch",
            Ignore { .. } => "ignore",
            Peek { .. } => "peek",
            PeekReady => "peek-ready",
            PeekDelayed => "peek-delayed",
            PeekBuried => "peek-buried",
            Kick { .. } => "kick",
            KickJob { .. } => "kick-job",
            StatsJob { .. } => "stats-job",
            StatsTube { .. } => "stats-tube",
            StatsServer => "stats",
            ListTubes => "list-tubes",
            ListTubeUsed => "list-tube-used",
            ListTubesWatched => "list-tubes-watched",
            Quit => "quit",
            PauseTube { .. } => "pause-tube",
            Use { .. } => "use",
        }
    }
}

/// Everything the broker can say back to a client. Each variant serialises to
/// the upper-case wire word of the same name, e.g. `NotIgnored` is
/// `NOT_IGNORED`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkResponse {
    /// Something went wrong inside the broker while running the command.
    InternalError,
    /// Bad arguments: non-numeric or out of range numbers, invalid or over
    /// long tube names, wrong arity or stray spaces.
    BadFormat,
    UnknownCommand,
    Inserted { id: JobId },
    /// The `put` body wasn't followed by CRLF.
    ExpectedCRLF,
    JobTooBig,
    Using { tube: String },
    /// The caller holds a job whose TTR runs out within the second.
    DeadlineSoon,
    TimedOut,
    /// `RESERVED <id> <bytes>` followed by the body.
    Reserved { id: JobId, data: Bytes },
    /// No job with that ID (or none the caller may act on), no job in the
    /// requested state, or no such tube.
    NotFound,
    Deleted,
    Released,
    Buried,
    Touched,
    Watching { count: usize },
    NotIgnored,
    /// `FOUND <id> <bytes>` followed by the body.
    Found { id: JobId, data: Bytes },
    /// `KICKED <count>` for `kick`.
    KickedCount { count: u64 },
    /// Plain `KICKED` for `kick-job`.
    Kicked,
    /// `OK <bytes>` followed by a YAML document, leading `---` line included.
    OkYaml { data: Vec<u8> },
    Paused,
}

impl BeanstalkResponse {
    /// Renders `value` as the YAML payload of an `OK` response. Flat maps
    /// and lists are written one `key: value` or `- item` line each, with
    /// scalars left unquoted, so a tube called `123` is listed as `- 123`.
    pub(crate) fn yaml<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let mut data = String::from("---\n");

        match serde_yaml::to_value(value)? {
            Value::Mapping(map) => {
                for (key, value) in &map {
                    data += &format!("{}: {}\n", scalar(key)?, scalar(value)?);
                }
            },
            Value::Sequence(items) => {
                for item in &items {
                    data += &format!("- {}\n", scalar(item)?);
                }
            },
            other => data += &serde_yaml::to_string(&other)?,
        }

        Ok(Self::OkYaml { data: data.into() })
    }
}

/// Writes a scalar as-is. Anything nested falls back to inline YAML.
fn scalar(value: &Value) -> Result<String> {
    Ok(match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)?.trim_end().to_string(),
    })
}

impl From<ParsingError> for BeanstalkResponse {
    fn from(value: ParsingError) -> Self {
        match value {
            ParsingError::BadFormat => Self::BadFormat,
            ParsingError::UnknownCommand => Self::UnknownCommand,
        }
    }
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            DeadlineSoon => b"DEADLINE_SOON\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => with_payload(
                format!("RESERVED {id} {}\r\n", data.len()),
                data,
            ),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Found { id, data } => {
                with_payload(format!("FOUND {id} {}\r\n", data.len()), data)
            },
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Kicked => b"KICKED\r\n".to_vec(),
            OkYaml { data } => {
                with_payload(format!("OK {}\r\n", data.len()), data)
            },
            Paused => b"PAUSED\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
        }
    }
}

/// Joins a header line, a payload and the payload's trailing CRLF.
fn with_payload(header: String, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + data.len() + 2);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// The `stats-job` document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct JobStats {
    pub(crate) id: JobId,
    pub(crate) tube: String,
    pub(crate) state: JobStatus,
    pub(crate) pri: u32,
    pub(crate) age: u64,
    pub(crate) delay: u32,
    pub(crate) ttr: u32,
    /// Seconds until a reserved or delayed job next changes state.
    pub(crate) time_left: u64,
    /// Always 0, there is no binlog.
    pub(crate) file: u32,
    pub(crate) reserves: u64,
    pub(crate) timeouts: u64,
    pub(crate) releases: u64,
    pub(crate) buries: u64,
    pub(crate) kicks: u64,
}

/// Job counts by state, shared by the tube and server stats.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct StateCounts {
    pub(crate) urgent: u64,
    pub(crate) ready: u64,
    pub(crate) reserved: u64,
    pub(crate) delayed: u64,
    pub(crate) buried: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TubeStats {
    pub(crate) name: String,
    pub(crate) current_jobs_urgent: u64,
    pub(crate) current_jobs_ready: u64,
    pub(crate) current_jobs_reserved: u64,
    pub(crate) current_jobs_delayed: u64,
    pub(crate) current_jobs_buried: u64,
    pub(crate) total_jobs: u64,
    pub(crate) current_using: u64,
    pub(crate) current_watching: u64,
    /// Watchers currently blocked in a reserve.
    pub(crate) current_waiting: u64,
    pub(crate) cmd_delete: u64,
    pub(crate) cmd_pause_tube: u64,
    pub(crate) pause: u32,
    pub(crate) pause_time_left: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ServerStats {
    pub(crate) current_jobs_urgent: u64,
    pub(crate) current_jobs_ready: u64,
    pub(crate) current_jobs_reserved: u64,
    pub(crate) current_jobs_delayed: u64,
    pub(crate) current_jobs_buried: u64,

    pub(crate) cmd_put: u64,
    pub(crate) cmd_peek: u64,
    pub(crate) cmd_peek_ready: u64,
    pub(crate) cmd_peek_delayed: u64,
    pub(crate) cmd_peek_buried: u64,
    pub(crate) cmd_reserve: u64,
    pub(crate) cmd_reserve_with_timeout: u64,
    pub(crate) cmd_delete: u64,
    pub(crate) cmd_release: u64,
    pub(crate) cmd_use: u64,
    pub(crate) cmd_watch: u64,
    pub(crate) cmd_ignore: u64,
    pub(crate) cmd_bury: u64,
    pub(crate) cmd_kick: u64,
    pub(crate) cmd_touch: u64,
    pub(crate) cmd_stats: u64,
    pub(crate) cmd_stats_job: u64,
    pub(crate) cmd_stats_tube: u64,
    pub(crate) cmd_list_tubes: u64,
    pub(crate) cmd_list_tube_used: u64,
    pub(crate) cmd_list_tubes_watched: u64,
    pub(crate) cmd_pause_tube: u64,

    pub(crate) job_timeouts: u64,
    pub(crate) total_jobs: u64,
    pub(crate) max_job_size: u32,
    pub(crate) current_tubes: u64,
    pub(crate) current_connections: u64,
    pub(crate) current_producers: u64,
    pub(crate) current_workers: u64,
    pub(crate) current_waiting: u64,
    pub(crate) total_connections: u64,
    pub(crate) pid: u32,
    pub(crate) version: &'static str,
    pub(crate) uptime: u64,

    // Always zero: there is no binlog.
    pub(crate) binlog_oldest_index: u64,
    pub(crate) binlog_current_index: u64,
    pub(crate) binlog_records_written: u64,
    pub(crate) binlog_records_migrated: u64,
    pub(crate) binlog_max_size: u64,

    /// Random per process.
    pub(crate) id: String,
    pub(crate) hostname: String,
}

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;
use emerald_beans::config::DEFAULT_MAX_JOB_SIZE;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11300)]
    pub(crate) port: u16,
    /// Sets the maximum allowed job size.
    #[arg(short = 'z', long, default_value_t = DEFAULT_MAX_JOB_SIZE)]
    pub(crate) max_job_size: u32,
    /// Hostname reported by `stats`.
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    pub(crate) hostname: String,
    /// Interval between sweeps for delay expiry, TTR and wait timeouts.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) tick_ms: u64,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

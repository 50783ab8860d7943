//! An in-memory work queue broker speaking the beanstalkd protocol.
//!
//! The [`broker::Broker`] owns every job, tube and connection. A transport
//! (see [`transport`]) feeds it complete command lines and job bodies and
//! relays the replies it emits; a periodic sweep drives time-based state
//! changes such as delay expiry and TTR timeouts.
pub mod broker;
pub mod config;
pub mod error;
pub mod line_reader;
pub mod parser;
pub mod transport;
pub mod types;
pub mod util;

pub(crate) mod connection;
pub(crate) mod jobs;
pub(crate) mod tube;

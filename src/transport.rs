//! Drives a single client connection against the broker, and the periodic
//! sweep that applies time-based state changes.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, Span};

use crate::broker::{Broker, ConnectionId, Step};
use crate::line_reader::LineReader;

/// Serves one client until it quits, hangs up, or `cancel` fires. The client
/// is registered with the broker for the duration, and on the way out any
/// jobs it holds are released.
#[instrument(name = "conn", skip_all, fields(id))]
pub async fn handle_conn<R, W>(
    broker: Arc<Broker>,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = broker.connect(tx);
    Span::current().record("id", id);

    let mut reader: LineReader<_> = reader.into();
    let ret =
        serve(&broker, id, &mut reader, &mut writer, &mut rx, &cancel).await;

    broker.disconnect(id);
    debug!("connection finished");

    ret
}

async fn serve<R, W>(
    broker: &Broker,
    id: ConnectionId,
    reader: &mut LineReader<R>,
    writer: &mut W,
    replies: &mut mpsc::UnboundedReceiver<Bytes>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            x = reader.read_line() => match x.context("reading command")? {
                Some(x) => x,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        let mut step = broker.execute(id, &line);

        if let Step::ReadBody { n_bytes, discard } = step {
            // The body is followed by a CRLF of its own.
            let len = n_bytes as usize + 2;

            let body = if discard {
                select! {
                    x = reader.discard(len) => if !x.context("skipping body")? {
                        return Ok(());
                    },
                    _ = cancel.cancelled() => return Ok(()),
                };
                Bytes::new()
            } else {
                select! {
                    x = reader.read_exact_bytes(len) => {
                        match x.context("reading body")? {
                            Some(x) => x,
                            None => return Ok(()),
                        }
                    },
                    _ = cancel.cancelled() => return Ok(()),
                }
            };

            step = broker.supply_body(id, body);
        }

        match step {
            Step::AwaitReply => {},
            Step::Quit => return Ok(()),
            Step::Ignored | Step::ReadBody { .. } => continue,
        }

        // Hold back any pipelined commands until the reply arrives, which for
        // a reserve may take a while, but notice the client hanging up.
        let reply = loop {
            select! {
                biased;
                reply = replies.recv() => break reply,
                x = reader.buffer_more() => if !x.context("reading ahead")? {
                    return Ok(());
                },
                _ = cancel.cancelled() => return Ok(()),
            }
        };
        let Some(reply) = reply else {
            return Ok(());
        };

        select! {
            x = writer.write_all(&reply) => x.context("writing reply")?,
            _ = cancel.cancelled() => return Ok(()),
        };

        // NB: flush() is a no-op for TcpStreams, but not for every transport.
        select! {
            x = writer.flush() => x.context("flushing reply")?,
            _ = cancel.cancelled() => return Ok(()),
        };
    }
}

/// Calls [`Broker::update_state`] every `period` until `cancel` fires.
pub async fn run_sweeper(
    broker: Arc<Broker>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticker.tick() => broker.update_state(),
            _ = cancel.cancelled() => break,
        }
    }

    debug!("sweeper stopped");
}

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::tube::DEFAULT_TUBE;
use crate::types::protocol::BeanstalkResponse;
use crate::types::serialisable::BeanstalkSerialisable;

pub type ConnectionId = u64;

/// Where a connection's replies are sent. The transport drains the other end
/// onto the socket.
pub type Outbound = mpsc::UnboundedSender<Bytes>;

/// Whether the client is blocked waiting for a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InboundState {
    Ready,
    /// Waiting for a job until the deadline, or indefinitely.
    Waiting { deadline: Option<Instant> },
    TimedOut,
    Closed,
}

/// A `put` whose body has yet to arrive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PendingPut {
    pub(crate) pri: u32,
    pub(crate) delay: u32,
    pub(crate) ttr: u32,
    pub(crate) n_bytes: u32,
}

/// Whether a request is being processed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum OutboundState {
    Ready,
    RequestInProgress,
    MultiPartPending(PendingPut),
    Closed,
}

/// Returned by [`ConnectionState::ignore`] when the tube is the last one
/// watched.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct LastWatchedTube;

/// The broker's view of one client: its tubes, its position in the
/// request/response cycle, and whether it is blocked in a `reserve`.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) id: ConnectionId,
    outbound: Outbound,
    inbound_state: InboundState,
    outbound_state: OutboundState,
    tube_used: String,
    /// In the order the tubes were first watched. Never empty.
    tubes_watched: Vec<String>,
    /// Set on the first `put` and never cleared.
    pub(crate) producer: bool,
    /// Set on the first `reserve` and never cleared.
    pub(crate) worker: bool,
}

impl ConnectionState {
    pub(crate) fn new(id: ConnectionId, outbound: Outbound) -> Self {
        Self {
            id,
            outbound,
            inbound_state: InboundState::Ready,
            outbound_state: OutboundState::Ready,
            tube_used: DEFAULT_TUBE.to_string(),
            tubes_watched: vec![DEFAULT_TUBE.to_string()],
            producer: false,
            worker: false,
        }
    }

    pub(crate) fn tube_used(&self) -> &str {
        &self.tube_used
    }

    pub(crate) fn tubes_watched(&self) -> &[String] {
        &self.tubes_watched
    }

    /// Whether a new command line may be executed. Lines arriving while a
    /// request is in flight, while waiting for a job, or while a `put` body
    /// is outstanding are refused.
    pub(crate) fn accepts_command(&mut self, now: Instant) -> bool {
        self.outbound_state == OutboundState::Ready && !self.is_waiting(now)
    }

    pub(crate) fn begin_request(&mut self) -> bool {
        if !matches!(
            self.outbound_state,
            OutboundState::Ready | OutboundState::MultiPartPending(_)
        ) {
            return false;
        }

        self.outbound_state = OutboundState::RequestInProgress;
        true
    }

    /// Parks a `put` until its body is supplied.
    pub(crate) fn begin_multi_part(&mut self, put: PendingPut) -> bool {
        if self.outbound_state != OutboundState::Ready {
            return false;
        }

        self.outbound_state = OutboundState::MultiPartPending(put);
        true
    }

    /// The parked `put`, if its body is what we're waiting for.
    pub(crate) fn pending_put(&self) -> Option<PendingPut> {
        match self.outbound_state {
            OutboundState::MultiPartPending(put) => Some(put),
            _ => None,
        }
    }

    /// Whether a request is awaiting its reply.
    pub(crate) fn in_request(&self) -> bool {
        self.outbound_state == OutboundState::RequestInProgress
    }

    fn complete_request(&mut self) -> bool {
        if self.outbound_state != OutboundState::RequestInProgress {
            return false;
        }

        self.outbound_state = OutboundState::Ready;
        true
    }

    /// Starts waiting for a job. Only possible from the ready state.
    pub(crate) fn wait(&mut self, deadline: Option<Instant>) -> bool {
        if self.inbound_state != InboundState::Ready {
            return false;
        }

        self.inbound_state = InboundState::Waiting { deadline };
        true
    }

    /// Whether the connection is still waiting for a job. A wait whose
    /// deadline has passed flips to timed out here.
    pub(crate) fn is_waiting(&mut self, now: Instant) -> bool {
        match self.inbound_state {
            InboundState::Waiting { deadline: None } => true,
            InboundState::Waiting {
                deadline: Some(deadline),
            } if deadline > now => true,
            InboundState::Waiting { .. } => {
                self.wait_timed_out();
                false
            },
            _ => false,
        }
    }

    pub(crate) fn wait_timed_out(&mut self) -> bool {
        if !matches!(self.inbound_state, InboundState::Waiting { .. }) {
            return false;
        }

        self.inbound_state = InboundState::TimedOut;
        true
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.inbound_state == InboundState::TimedOut
    }

    fn response_received(&mut self) -> bool {
        if !matches!(
            self.inbound_state,
            InboundState::Waiting { .. } | InboundState::TimedOut
        ) {
            return false;
        }

        self.inbound_state = InboundState::Ready;
        true
    }

    fn is_alive(&self) -> bool {
        self.inbound_state != InboundState::Closed
            && self.outbound_state != OutboundState::Closed
    }

    /// Sends a reply, completing the request in flight and ending any wait.
    pub(crate) fn transmit(&mut self, response: &BeanstalkResponse) {
        if !self.is_alive() {
            return;
        }

        trace!(connection = self.id, ?response, "transmitting");

        // The receiver is only gone once the transport has hung up, in which
        // case the broker is about to forget this connection anyway.
        let _ = self.outbound.send(response.to_frame());
        self.complete_request();
        self.response_received();
    }

    pub(crate) fn close(&mut self) {
        self.inbound_state = InboundState::Closed;
        self.outbound_state = OutboundState::Closed;
    }

    pub(crate) fn use_tube(&mut self, tube: &str) {
        self.tube_used = tube.to_string();
    }

    /// Adds a tube to the watch list, returning false if already watched.
    pub(crate) fn watch(&mut self, tube: &str) -> bool {
        if self.is_watching(tube) {
            return false;
        }

        self.tubes_watched.push(tube.to_string());
        true
    }

    pub(crate) fn is_watching(&self, tube: &str) -> bool {
        self.tubes_watched.iter().any(|t| t == tube)
    }

    /// Removes a tube from the watch list. The last tube can't be removed.
    pub(crate) fn ignore(&mut self, tube: &str) -> Result<(), LastWatchedTube> {
        if self.tubes_watched.len() == 1 {
            return Err(LastWatchedTube);
        }

        self.tubes_watched.retain(|t| t != tube);
        Ok(())
    }

    /// Empties the watch list, returning what was watched. Only used when
    /// the connection goes away.
    pub(crate) fn ignore_all(&mut self) -> Vec<String> {
        std::mem::take(&mut self.tubes_watched)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn conn() -> (ConnectionState, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionState::new(1, tx), rx)
    }

    #[test]
    fn test_defaults() {
        let (c, _rx) = conn();
        assert_eq!(c.tube_used(), "default");
        assert_eq!(c.tubes_watched(), ["default"]);
        assert!(!c.producer);
        assert!(!c.worker);
    }

    #[test]
    fn test_one_request_at_a_time() {
        let now = Instant::now();
        let (mut c, mut rx) = conn();

        assert!(c.accepts_command(now));
        assert!(c.begin_request());
        assert!(!c.accepts_command(now));
        assert!(!c.begin_request());

        c.transmit(&BeanstalkResponse::Deleted);
        assert_eq!(rx.try_recv().unwrap(), "DELETED\r\n");
        assert!(c.accepts_command(now));
    }

    #[test]
    fn test_multi_part() {
        let now = Instant::now();
        let (mut c, _rx) = conn();
        let put = PendingPut {
            pri: 1,
            delay: 0,
            ttr: 5,
            n_bytes: 3,
        };

        assert!(c.begin_multi_part(put));
        assert!(!c.accepts_command(now));
        assert_eq!(c.pending_put(), Some(put));
        assert!(c.begin_request());
        assert_eq!(c.pending_put(), None);
    }

    #[test]
    fn test_wait_lifecycle() {
        let now = Instant::now();
        let (mut c, _rx) = conn();

        assert!(c.begin_request());
        assert!(c.wait(Some(now + Duration::from_secs(2))));
        assert!(!c.wait(None));
        assert!(c.is_waiting(now + Duration::from_secs(1)));
        assert!(!c.accepts_command(now));

        assert!(!c.is_waiting(now + Duration::from_secs(2)));
        assert!(c.is_timed_out());

        c.transmit(&BeanstalkResponse::TimedOut);
        assert!(!c.is_timed_out());
        assert!(c.accepts_command(now));
        assert!(c.wait(None));
        assert!(c.is_waiting(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_watch_and_ignore() {
        let (mut c, _rx) = conn();

        assert_eq!(c.ignore("default"), Err(LastWatchedTube));
        assert!(c.watch("emails"));
        assert!(!c.watch("emails"));
        assert_eq!(c.tubes_watched(), ["default", "emails"]);

        assert_eq!(c.ignore("default"), Ok(()));
        assert_eq!(c.tubes_watched(), ["emails"]);
        assert_eq!(c.ignore("emails"), Err(LastWatchedTube));

        assert_eq!(c.ignore_all(), ["emails"]);
        assert!(c.tubes_watched().is_empty());
    }

    #[test]
    fn test_closed_connection_is_silent() {
        let (mut c, mut rx) = conn();
        c.close();
        c.transmit(&BeanstalkResponse::Deleted);
        assert!(rx.try_recv().is_err());
    }
}

//! Lifecycle of a single in-flight query.
//!
//! ```text
//! Building -> Sent -> (Retrying <-> Sent) -> Completed | Failed | Cancelled
//! ```
//!
//! A request only ever reaches a terminal state by being consumed: `complete`,
//! `fail` and `cancel` take `self`, so the callback cannot run twice.

use std::fmt;
use std::time::Instant;

use tokio_util::time::delay_queue;

use crate::dns::{self, RecordType, Reply};
use crate::error::EncodeError;
use crate::session::{AsyncSession, EventId};

/// Completion callback; whatever the caller needs travels inside the closure.
pub type Callback = Box<dyn FnOnce(Reply)>;

/// Stable identity of a request across retransmissions.
///
/// Transaction IDs change on every retransmission; handles do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub(crate) u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Building,
    Sent,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// What to do when a request's timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutAction {
    Retransmit,
    GiveUp,
}

/// Callback and reply of a request that just finished, run once the
/// resolver is no longer borrowed.
pub(crate) struct Completion {
    callback: Callback,
    reply: Reply,
}

impl Completion {
    pub(crate) fn run(self) {
        (self.callback)(self.reply)
    }
}

pub(crate) struct Request {
    pub(crate) handle: RequestHandle,
    pub(crate) id: u16,
    pub(crate) server: usize,
    pub(crate) rtype: RecordType,
    pub(crate) name: String,
    pub(crate) packet: Vec<u8>,
    pub(crate) retransmits: u32,
    pub(crate) timer: Option<delay_queue::Key>,
    /// Packet is waiting in the server's outbox for the socket to drain.
    pub(crate) unsent: bool,
    pub(crate) started: Instant,
    state: RequestState,
    session: Option<(AsyncSession, EventId)>,
    callback: Callback,
}

impl Request {
    pub(crate) fn build(
        handle: RequestHandle,
        name: &str,
        rtype: RecordType,
        id: u16,
        server: usize,
        callback: Callback,
    ) -> Result<Self, EncodeError> {
        let packet = dns::encode_query(name, rtype, id)?;

        Ok(Self {
            handle,
            id,
            server,
            rtype,
            name: dns::normalize_name(name).to_string(),
            packet,
            retransmits: 0,
            timer: None,
            unsent: false,
            started: Instant::now(),
            state: RequestState::Building,
            session: None,
            callback,
        })
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn attach_session(&mut self, session: AsyncSession, event: EventId) {
        self.session = Some((session, event));
    }

    /// The packet has been handed to the socket (or the attempt failed and
    /// will be retried when the timer fires).
    pub(crate) fn mark_sent(&mut self) {
        self.state = if self.retransmits == 0 {
            RequestState::Sent
        } else {
            RequestState::Retrying
        };
    }

    pub(crate) fn on_timeout(&mut self, max_retransmits: u32) -> TimeoutAction {
        if self.retransmits < max_retransmits {
            self.retransmits += 1;
            self.state = RequestState::Retrying;
            TimeoutAction::Retransmit
        } else {
            self.state = RequestState::Failed;
            TimeoutAction::GiveUp
        }
    }

    /// Move the request to a new transaction ID; the question is unchanged.
    pub(crate) fn rekey(&mut self, id: u16) {
        self.id = id;
        dns::set_id(&mut self.packet, id);
    }

    /// Whether `datagram` is a response echoing this request's question.
    pub(crate) fn accepts(&self, datagram: &[u8]) -> bool {
        dns::echoes_question(&self.packet, datagram)
    }

    /// Finish with `reply` and release the session's unit of work.
    pub(crate) fn complete(mut self, reply: Reply) -> Completion {
        self.state = RequestState::Completed;
        self.finish(reply)
    }

    /// Give up: deliver a failure reply.
    pub(crate) fn fail(mut self, reply: Reply) -> Completion {
        self.state = RequestState::Failed;
        self.finish(reply)
    }

    fn finish(mut self, mut reply: Reply) -> Completion {
        debug_assert!(self.state.is_terminal());
        self.release_session();
        reply.set_request(self.handle);

        Completion {
            callback: self.callback,
            reply,
        }
    }

    /// Drop the request without running its callback.
    pub(crate) fn cancel(mut self) {
        self.state = RequestState::Cancelled;
        self.release_session();
    }

    fn release_session(&mut self) {
        if let Some((session, event)) = self.session.take() {
            session.remove_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{ResponseCode, decode_reply, peek_id};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn request(callback: Callback) -> Request {
        Request::build(
            RequestHandle(1),
            "example.com.",
            RecordType::A,
            0x1111,
            0,
            callback,
        )
        .unwrap()
    }

    fn response_to(packet: &[u8]) -> Vec<u8> {
        let mut response = packet.to_vec();
        response[2] |= 0x80;
        response
    }

    #[test]
    fn retransmits_until_bound_then_fails() {
        let mut req = request(Box::new(|_| {}));
        assert_eq!(req.state(), RequestState::Building);

        req.mark_sent();
        assert_eq!(req.state(), RequestState::Sent);

        for expected in 1..=3 {
            assert_eq!(req.on_timeout(3), TimeoutAction::Retransmit);
            assert_eq!(req.retransmits, expected);
            assert_eq!(req.state(), RequestState::Retrying);
            req.mark_sent();
            assert_eq!(req.state(), RequestState::Retrying);
        }

        assert_eq!(req.on_timeout(3), TimeoutAction::GiveUp);
        assert_eq!(req.state(), RequestState::Failed);
        assert!(req.state().is_terminal());
    }

    #[test]
    fn zero_retransmits_fails_on_first_timeout() {
        let mut req = request(Box::new(|_| {}));
        req.mark_sent();

        assert_eq!(req.on_timeout(0), TimeoutAction::GiveUp);
    }

    #[test]
    fn rekey_changes_only_the_id() {
        let mut req = request(Box::new(|_| {}));
        let before = req.packet.clone();

        req.rekey(0x2222);

        assert_eq!(req.id, 0x2222);
        assert_eq!(peek_id(&req.packet), Some(0x2222));
        assert_eq!(&req.packet[2..], &before[2..]);
        assert!(req.accepts(&response_to(&req.packet)));
    }

    #[test]
    fn accepts_requires_matching_question() {
        let req = request(Box::new(|_| {}));

        let other_name = dns::encode_query("example.org", RecordType::A, 0x1111).unwrap();
        let other_type = dns::encode_query("example.com", RecordType::Mx, 0x1111).unwrap();
        let upper = dns::encode_query("EXAMPLE.com", RecordType::A, 0x1111).unwrap();

        assert!(!req.accepts(&response_to(&other_name)));
        assert!(!req.accepts(&response_to(&other_type)));
        assert!(!req.accepts(&[0x11, 0x11, 0x81]));
        assert!(req.accepts(&response_to(&upper)));

        let mut single_label = req.packet[..12].to_vec();
        single_label.extend_from_slice(b"\x0bexample.com\x00\x00\x01\x00\x01");
        assert!(!req.accepts(&response_to(&single_label)));
    }

    #[test]
    fn complete_runs_callback_with_handle_and_releases_session() {
        let got = Rc::new(RefCell::new(None));
        let slot = got.clone();
        let mut req = request(Box::new(move |reply| {
            *slot.borrow_mut() = Some(reply);
        }));

        let session = AsyncSession::new();
        let event = session.add_event(|| panic!("finalizer must not run")).unwrap();
        req.attach_session(session.clone(), event);
        req.mark_sent();

        let reply = decode_reply(&response_to(&req.packet), RecordType::A).unwrap();
        req.complete(reply).run();

        let reply = got.borrow_mut().take().unwrap();
        assert_eq!(reply.request(), Some(RequestHandle(1)));
        assert_eq!(reply.code(), ResponseCode::NoError);
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn cancel_drops_callback() {
        let called = Rc::new(RefCell::new(false));
        let flag = called.clone();
        let mut req = request(Box::new(move |_| *flag.borrow_mut() = true));

        let session = AsyncSession::new();
        let event = session.add_event(|| {}).unwrap();
        req.attach_session(session.clone(), event);

        req.cancel();

        assert!(!*called.borrow());
        assert_eq!(session.pending(), 0);
    }
}

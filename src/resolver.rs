//! Resolver context.
//!
//! Owns the upstream sockets, the transaction ID permutor and the table of
//! in-flight requests keyed by transaction ID. Inbound datagrams and timer
//! expirations are routed to the request they belong to; callbacks run only
//! after the context is released, so they may start new requests.
//!
//! Everything runs on one thread: the resolver is `!Send` and its driver is
//! spawned on the current [`LocalSet`](tokio::task::LocalSet).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{Span, debug, info, warn};

use crate::config::ResolverConfig;
use crate::dns::{self, MAX_DNS_PACKET_SIZE, RecordType, Reply, ResponseCode};
use crate::error::StartError;
use crate::permutor::Permutor;
use crate::request::{Callback, Completion, Request, RequestHandle, TimeoutAction};
use crate::session::AsyncSession;
use crate::stats::ResolverStats;
use crate::upstream::UpstreamPool;

/// Datagrams read from one socket per readiness event.
const RECV_BATCH: usize = 32;

enum DriverEvent {
    Writable(usize),
    Readable(usize),
    Expired(u16, delay_queue::Key),
    Closed,
}

struct ResolverInner {
    pool: UpstreamPool,
    permutor: Permutor,
    requests: FxHashMap<u16, Request>,
    handles: FxHashMap<RequestHandle, u16>,
    timers: DelayQueue<u16>,
    /// Per server, IDs of requests whose packet the socket would not take yet.
    outbox: Vec<VecDeque<u16>>,
    timeout: Duration,
    max_retransmits: u32,
    next_handle: u64,
    stats: Arc<ResolverStats>,
    span: Span,
    driver: Option<Waker>,
    closed: bool,
}

/// Handle to a resolver context. Clones share the same context.
#[derive(Clone)]
pub struct Resolver {
    inner: Rc<RefCell<ResolverInner>>,
}

impl Resolver {
    /// Bind the upstream sockets without starting the event driver.
    ///
    /// Datagrams and timers are then only processed through
    /// [`on_readable`](Self::on_readable) and [`on_timer`](Self::on_timer).
    /// Diagnostics are emitted as children of `span`.
    pub async fn bind(config: &ResolverConfig, span: Span) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let pool = UpstreamPool::bind(&config.servers, config.health).await?;
        let servers: Vec<&str> = pool.iter().map(|s| s.name()).collect();
        info!(
            parent: &span,
            servers = %servers.join(", "),
            timeout_ms = config.timeout.as_millis() as u64,
            max_retransmits = config.max_retransmits,
            "resolver initialized"
        );

        let inner = ResolverInner {
            outbox: vec![VecDeque::new(); pool.len()],
            pool,
            permutor: Permutor::new(config.id_range.clone()),
            requests: FxHashMap::default(),
            handles: FxHashMap::default(),
            timers: DelayQueue::new(),
            timeout: config.timeout,
            max_retransmits: config.max_retransmits,
            next_handle: 0,
            stats: Arc::new(ResolverStats::new()),
            span,
            driver: None,
            closed: false,
        };

        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Bind the upstream sockets and spawn the event driver on the current
    /// `LocalSet`.
    pub async fn spawn(config: &ResolverConfig, span: Span) -> io::Result<Self> {
        let resolver = Self::bind(config, span).await?;
        tokio::task::spawn_local(drive(Rc::downgrade(&resolver.inner)));
        Ok(resolver)
    }

    /// Start a query for `name`.
    ///
    /// `callback` runs exactly once with the outcome unless the request is
    /// cancelled first. The request holds one unit of work on `session` until
    /// it finishes; destroying the session cancels it.
    pub fn start_request(
        &self,
        name: &str,
        rtype: RecordType,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        let weak = Rc::downgrade(&self.inner);
        self.inner
            .borrow_mut()
            .start(weak, name, rtype, session, Box::new(callback))
    }

    pub fn resolve_a(
        &self,
        name: &str,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        self.start_request(name, RecordType::A, session, callback)
    }

    /// Reverse lookup of an IPv4 address.
    pub fn resolve_ptr(
        &self,
        addr: Ipv4Addr,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        self.start_request(&dns::ptr_name(addr), RecordType::Ptr, session, callback)
    }

    pub fn resolve_mx(
        &self,
        name: &str,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        self.start_request(name, RecordType::Mx, session, callback)
    }

    pub fn resolve_txt(
        &self,
        name: &str,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        self.start_request(name, RecordType::Txt, session, callback)
    }

    pub fn resolve_spf(
        &self,
        name: &str,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        self.start_request(name, RecordType::Spf, session, callback)
    }

    /// Service lookup of `_service._proto.name`.
    pub fn resolve_srv(
        &self,
        service: &str,
        proto: &str,
        name: &str,
        session: &AsyncSession,
        callback: impl FnOnce(Reply) + 'static,
    ) -> Result<RequestHandle, StartError> {
        let name = dns::srv_name(service, proto, name);
        self.start_request(&name, RecordType::Srv, session, callback)
    }

    /// Drop a request without running its callback.
    ///
    /// Returns `false` if the request already finished.
    pub fn cancel(&self, handle: RequestHandle) -> bool {
        let request = {
            let mut inner = self.inner.borrow_mut();
            let Some(id) = inner.handles.get(&handle).copied() else {
                return false;
            };
            let Some(request) = inner.deregister(id) else {
                return false;
            };
            inner.stats.record_cancelled();
            debug!(parent: &inner.span, %handle, name = %request.name, "request cancelled");
            request
        };

        request.cancel();
        true
    }

    /// Process datagrams waiting on the socket of upstream `server`.
    pub fn on_readable(&self, server: usize) {
        let completions = self.inner.borrow_mut().drain_socket(server);
        for completion in completions {
            completion.run();
        }
    }

    /// Timeout of the request currently holding transaction ID `id`.
    pub fn on_timer(&self, id: u16) {
        let completion = self.inner.borrow_mut().timeout(id);
        if let Some(completion) = completion {
            completion.run();
        }
    }

    fn on_writable(&self, server: usize) {
        self.inner.borrow_mut().flush(server);
    }

    fn on_expired(&self, id: u16, key: delay_queue::Key) {
        let completion = self.inner.borrow_mut().expired(id, key);
        if let Some(completion) = completion {
            completion.run();
        }
    }

    /// Cancel every outstanding request and close the sockets.
    ///
    /// Later calls to [`start_request`](Self::start_request) fail with
    /// [`StartError::Shutdown`].
    pub fn shutdown(&self) {
        let cancelled: Vec<Request> = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;

            let ids: Vec<u16> = inner.requests.keys().copied().collect();
            let cancelled: Vec<Request> = ids
                .into_iter()
                .filter_map(|id| inner.deregister(id))
                .collect();
            for _ in &cancelled {
                inner.stats.record_cancelled();
            }

            inner.pool.close();
            inner.outbox.iter_mut().for_each(VecDeque::clear);
            if let Some(waker) = inner.driver.take() {
                waker.wake();
            }
            info!(parent: &inner.span, cancelled = cancelled.len(), "resolver shut down");
            cancelled
        };

        for request in cancelled {
            request.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Number of requests currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.borrow().requests.len()
    }

    /// Transaction ID currently used by a request.
    pub fn transaction_id(&self, handle: RequestHandle) -> Option<u16> {
        self.inner.borrow().handles.get(&handle).copied()
    }

    pub fn stats(&self) -> Arc<ResolverStats> {
        Arc::clone(&self.inner.borrow().stats)
    }
}

impl ResolverInner {
    fn start(
        &mut self,
        weak: Weak<RefCell<ResolverInner>>,
        name: &str,
        rtype: RecordType,
        session: &AsyncSession,
        callback: Callback,
    ) -> Result<RequestHandle, StartError> {
        if self.closed {
            return Err(StartError::Shutdown);
        }
        if session.is_destroyed() {
            return Err(StartError::SessionClosed);
        }

        let handle = RequestHandle(self.next_handle);
        let mut request = Request::build(handle, name, rtype, 0, 0, callback)?;
        let id = self.free_id().ok_or(StartError::IdSpaceExhausted)?;
        let now = Instant::now();
        request.server = self.pool.select(now)?;
        request.rekey(id);

        let event = session
            .add_event(move || {
                if let Some(inner) = weak.upgrade() {
                    Resolver { inner }.cancel(handle);
                }
            })
            .ok_or(StartError::SessionClosed)?;
        request.attach_session(session.clone(), event);
        self.next_handle += 1;
        self.stats.record_request();

        debug!(
            parent: &self.span,
            %handle,
            id,
            name = %request.name,
            rtype = %rtype,
            server = self.server_name(request.server),
            "sending request"
        );
        self.transmit(&mut request, now);
        self.register(request);
        Ok(handle)
    }

    /// Draw IDs until one is not in flight. Two passes over the permutor's
    /// range always include one complete cycle.
    fn free_id(&mut self) -> Option<u16> {
        for _ in 0..2 * self.permutor.len() {
            let id = self.permutor.next_id();
            if !self.requests.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn server_name(&self, index: usize) -> &str {
        self.pool.get(index).map(|s| s.name()).unwrap_or("<closed>")
    }

    /// Send the request's packet and arm its timer.
    ///
    /// A socket that is not writable yet queues the packet in the server's
    /// outbox; the driver flushes it once the socket reports ready. A failed
    /// send is not retried here: the timer still fires and the attempt
    /// counts against the retransmit budget.
    fn transmit(&mut self, request: &mut Request, now: Instant) {
        request.unsent = false;
        if let Some(upstream) = self.pool.get(request.server) {
            match upstream.socket().try_send(&request.packet) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    request.unsent = true;
                    self.outbox[request.server].push_back(request.id);
                }
                Err(e) => self.send_failed(request.server, &request.name, &e, now),
            }
        }

        request.timer = Some(self.timers.insert(request.id, self.timeout));
        request.mark_sent();
    }

    /// Send queued packets of `server` until its socket pushes back.
    fn flush(&mut self, server: usize) {
        while let Some(&id) = self.outbox.get(server).and_then(|queue| queue.front()) {
            let Some(upstream) = self.pool.get(server) else {
                return;
            };
            let Some(request) = self
                .requests
                .get_mut(&id)
                .filter(|request| request.unsent && request.server == server)
            else {
                self.outbox[server].pop_front();
                continue;
            };

            match upstream.socket().try_send(&request.packet) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Ok(_) => {
                    request.unsent = false;
                    self.outbox[server].pop_front();
                }
                Err(e) => {
                    request.unsent = false;
                    let name = request.name.clone();
                    self.outbox[server].pop_front();
                    self.send_failed(server, &name, &e, Instant::now());
                }
            }
        }
    }

    fn send_failed(&mut self, server: usize, name: &str, error: &io::Error, now: Instant) {
        warn!(
            parent: &self.span,
            server = self.server_name(server),
            name,
            error = %error,
            "failed to send request"
        );
        self.stats.record_send_error();
        self.pool.mark_failed(server, now);
    }

    fn register(&mut self, request: Request) {
        self.handles.insert(request.handle, request.id);
        self.requests.insert(request.id, request);
        if let Some(waker) = &self.driver {
            waker.wake_by_ref();
        }
    }

    /// Remove a request from the table and disarm its timer.
    ///
    /// This is the only place a table entry is dropped.
    fn deregister(&mut self, id: u16) -> Option<Request> {
        let mut request = self.requests.remove(&id)?;
        self.handles.remove(&request.handle);
        if let Some(key) = request.timer.take() {
            self.timers.remove(&key);
        }
        Some(request)
    }

    fn drain_socket(&mut self, server: usize) -> Vec<Completion> {
        let mut completions = Vec::new();
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        for _ in 0..RECV_BATCH {
            let Some(upstream) = self.pool.get(server) else {
                break;
            };

            match upstream.socket().try_recv(&mut buf) {
                Ok(len) => {
                    if let Some(completion) = self.dispatch(server, &buf[..len]) {
                        completions.push(completion);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(
                        parent: &self.span,
                        server = upstream.name(),
                        error = %e,
                        "failed to receive reply"
                    );
                    self.pool.mark_failed(server, Instant::now());
                }
            }
        }
        completions
    }

    fn dispatch(&mut self, server: usize, datagram: &[u8]) -> Option<Completion> {
        let Some(id) = dns::peek_id(datagram) else {
            debug!(parent: &self.span, len = datagram.len(), "dropping short datagram");
            return None;
        };
        let Some(request) = self.requests.get(&id) else {
            debug!(parent: &self.span, id, "dropping reply for unknown transaction");
            return None;
        };
        if request.server != server || !request.accepts(datagram) {
            self.stats.record_spoofed();
            debug!(
                parent: &self.span,
                id,
                server = self.server_name(server),
                "discarding reply that does not match its request"
            );
            return None;
        }

        let request = self.deregister(id)?;
        self.pool.mark_ok(server);

        let mut reply = match dns::decode_reply(datagram, request.rtype) {
            Ok(reply) => {
                self.stats.record_reply(request.started.elapsed());
                reply
            }
            Err(e) => {
                warn!(
                    parent: &self.span,
                    name = %request.name,
                    rtype = %request.rtype,
                    server = self.server_name(server),
                    error = %e,
                    "malformed reply"
                );
                self.stats.record_malformed();
                Reply::empty(request.rtype, ResponseCode::FormErr, &request.name)
            }
        };
        reply.set_server(self.server_name(server));
        Some(request.complete(reply))
    }

    /// Timer expiry reported by the queue; `key` must still be the
    /// request's live timer.
    fn expired(&mut self, id: u16, key: delay_queue::Key) -> Option<Completion> {
        let request = self.requests.get_mut(&id)?;
        if request.timer != Some(key) {
            return None;
        }
        request.timer = None;
        self.timeout(id)
    }

    fn timeout(&mut self, id: u16) -> Option<Completion> {
        let mut request = self.deregister(id)?;

        match request.on_timeout(self.max_retransmits) {
            TimeoutAction::GiveUp => Some(self.give_up(request)),
            TimeoutAction::Retransmit => {
                let now = Instant::now();
                let Some(id) = self.free_id() else {
                    return Some(self.give_up(request));
                };
                let Ok(server) = self.pool.select(now) else {
                    return Some(self.give_up(request));
                };

                request.rekey(id);
                request.server = server;
                self.stats.record_retransmit();
                debug!(
                    parent: &self.span,
                    handle = %request.handle,
                    id,
                    attempt = request.retransmits,
                    state = ?request.state(),
                    server = self.server_name(server),
                    "retransmitting request"
                );
                self.transmit(&mut request, now);
                self.register(request);
                None
            }
        }
    }

    fn give_up(&mut self, request: Request) -> Completion {
        self.pool.mark_failed(request.server, Instant::now());
        self.stats.record_timeout();
        warn!(
            parent: &self.span,
            name = %request.name,
            rtype = %request.rtype,
            retransmits = request.retransmits,
            "maximum number of retransmits expired"
        );

        let mut reply = Reply::empty(request.rtype, ResponseCode::Timeout, &request.name);
        reply.set_server(self.server_name(request.server));
        request.fail(reply)
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<DriverEvent> {
        if self.closed {
            return Poll::Ready(DriverEvent::Closed);
        }
        if !self.driver.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
            self.driver = Some(cx.waker().clone());
        }

        for (index, queue) in self.outbox.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            if let Some(upstream) = self.pool.get(index) {
                if upstream.socket().poll_send_ready(cx).is_ready() {
                    return Poll::Ready(DriverEvent::Writable(index));
                }
            }
        }

        for (index, upstream) in self.pool.iter().enumerate() {
            if upstream.socket().poll_recv_ready(cx).is_ready() {
                return Poll::Ready(DriverEvent::Readable(index));
            }
        }

        if let Poll::Ready(Some(expired)) = self.timers.poll_expired(cx) {
            return Poll::Ready(DriverEvent::Expired(*expired.get_ref(), expired.key()));
        }
        Poll::Pending
    }
}

impl Drop for ResolverInner {
    /// Requests still registered are cancelled so their sessions drain.
    fn drop(&mut self) {
        for (_, request) in self.requests.drain() {
            self.stats.record_cancelled();
            request.cancel();
        }
        if let Some(waker) = self.driver.take() {
            waker.wake();
        }
    }
}

/// Event driver: waits for socket readiness or timer expiry and dispatches
/// into the resolver. Exits once the resolver is shut down or dropped.
async fn drive(inner: Weak<RefCell<ResolverInner>>) {
    loop {
        let event = poll_fn(|cx| match inner.upgrade() {
            Some(inner) => {
                let mut inner = inner.borrow_mut();
                inner.poll_event(cx)
            }
            None => Poll::Ready(DriverEvent::Closed),
        })
        .await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let resolver = Resolver { inner };
        match event {
            DriverEvent::Writable(server) => resolver.on_writable(server),
            DriverEvent::Readable(server) => resolver.on_readable(server),
            DriverEvent::Expired(id, key) => resolver.on_expired(id, key),
            DriverEvent::Closed => return,
        }
    }
}

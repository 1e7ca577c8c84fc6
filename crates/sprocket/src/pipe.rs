//! The pipe engine.
//!
//! A pipe is one end of an established connection: it performs the
//! eight-byte protocol handshake, then moves length-prefixed frames
//! between user AIOs and the byte stream. Wire format: every message is
//! `[len: u64 BE][header bytes][body bytes]`, `len` covering header plus
//! body; zero-length messages are legal.
//!
//! The send and receive paths are state machines resumed by the
//! completion callbacks of the pipe's three owned AIOs (`txaio`, `rxaio`,
//! `negoaio`). At most one stream-level transfer is in flight per
//! direction; the head of the user queue is the request whose data the
//! in-flight transfer carries, and partial transfers advance the AIO's
//! buffers and resubmit before anything is dequeued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use sprocket_core::{Aio, AioTimeout, Error, Message, OptValue, Result, names, next_id, reap};
use sprocket_stream::Connection;

use crate::endpoint::Ep;

/// Deadline for the whole handshake exchange.
const NEGO_TIMEOUT: Duration = Duration::from_secs(10);

const HANDSHAKE_LEN: usize = 8;
const FRAME_HEADER_LEN: usize = 8;

enum NegoStep {
    SendMore(Bytes),
    RecvMore(usize),
    Done,
    Fail(Error),
}

#[derive(Default)]
struct PipeStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    errors: AtomicU64,
}

struct PipeState {
    peer: u16,
    rcvmax: usize,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    closed: bool,
    sendq: VecDeque<Arc<Aio>>,
    recvq: VecDeque<Arc<Aio>>,
    /// Wire length of the message the in-flight tx transfer carries.
    tx_len: usize,
    /// Body length once the inbound frame header has been decoded.
    rx_len: Option<usize>,
    /// Bytes of the current inbound frame consumed so far; a closure with
    /// this nonzero is mid-frame and therefore a protocol error.
    rx_got: usize,
    txlen: [u8; HANDSHAKE_LEN],
    rxlen: [u8; HANDSHAKE_LEN],
    gottx: usize,
    gotrx: usize,
    wanttx: usize,
    wantrx: usize,
    tx_inflight: bool,
    rx_inflight: bool,
}

pub(crate) struct PipeInner {
    id: u64,
    proto: u16,
    conn: Arc<Connection>,
    ep: Weak<Ep>,
    txaio: Arc<Aio>,
    rxaio: Arc<Aio>,
    negoaio: Arc<Aio>,
    reaped: AtomicBool,
    stats: PipeStats,
    st: Mutex<PipeState>,
}

impl PipeInner {
    pub(crate) fn new(conn: Arc<Connection>, proto: u16, ep: &Arc<Ep>) -> Arc<PipeInner> {
        Arc::new_cyclic(|weak: &Weak<PipeInner>| {
            let w = weak.clone();
            let txaio = Aio::new(move || {
                if let Some(p) = w.upgrade() {
                    p.send_cb();
                }
            });
            let w = weak.clone();
            let rxaio = Aio::new(move || {
                if let Some(p) = w.upgrade() {
                    p.recv_cb();
                }
            });
            let w = weak.clone();
            let negoaio = Aio::new(move || {
                if let Some(p) = w.upgrade() {
                    p.nego_cb();
                }
            });
            PipeInner {
                id: next_id(),
                proto,
                conn,
                ep: Arc::downgrade(ep),
                txaio,
                rxaio,
                negoaio,
                reaped: AtomicBool::new(false),
                stats: PipeStats::default(),
                st: Mutex::new(PipeState {
                    peer: 0,
                    rcvmax: 0,
                    send_timeout: None,
                    recv_timeout: None,
                    closed: false,
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    tx_len: 0,
                    rx_len: None,
                    rx_got: 0,
                    txlen: [0; HANDSHAKE_LEN],
                    rxlen: [0; HANDSHAKE_LEN],
                    gottx: 0,
                    gotrx: 0,
                    wanttx: 0,
                    wantrx: 0,
                    tx_inflight: false,
                    rx_inflight: false,
                }),
            }
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer(&self) -> u16 {
        self.st.lock().peer
    }

    /// Copy endpoint-level settings onto a freshly matched pipe.
    pub(crate) fn imprint(
        &self,
        rcvmax: usize,
        send_timeout: Option<Duration>,
        recv_timeout: Option<Duration>,
    ) {
        let mut g = self.st.lock();
        g.rcvmax = rcvmax;
        g.send_timeout = send_timeout;
        g.recv_timeout = recv_timeout;
    }

    // ── Handshake ───────────────────────────────────────────────────────

    /// Begin the handshake. The caller (endpoint) has already placed this
    /// pipe on its negotiating list and taken a reference for it.
    pub(crate) fn start(self: &Arc<Self>) {
        let first = {
            let mut g = self.st.lock();
            g.txlen = [0, b'S', b'P', 0, 0, 0, 0, 0];
            g.txlen[4..6].copy_from_slice(&self.proto.to_be_bytes());
            g.gottx = 0;
            g.gotrx = 0;
            g.wanttx = HANDSHAKE_LEN;
            g.wantrx = HANDSHAKE_LEN;
            Bytes::copy_from_slice(&g.txlen)
        };
        self.negoaio.set_timeout(AioTimeout::After(NEGO_TIMEOUT));
        self.negoaio.set_iov(vec![first]);
        self.conn.send(&self.negoaio);
    }

    fn nego_cb(self: &Arc<Self>) {
        let Some(ep) = self.ep.upgrade() else { return };
        let step = match self.negoaio.result() {
            // A peer hanging up mid-handshake must not read as endpoint
            // closure further up.
            Err(Error::Closed) => NegoStep::Fail(Error::ConnectionShutdown),
            Err(e) => NegoStep::Fail(e),
            Ok(()) => self.nego_step(),
        };
        match step {
            NegoStep::SendMore(rest) => {
                self.negoaio.set_iov(vec![rest]);
                self.conn.send(&self.negoaio);
            }
            NegoStep::RecvMore(want) => {
                self.negoaio.set_recv_buf(BytesMut::zeroed(want));
                self.conn.recv(&self.negoaio);
            }
            NegoStep::Done => ep.handshake_done(self),
            NegoStep::Fail(e) => {
                tracing::debug!(pipe = self.id, err = %e, "handshake failed");
                ep.handshake_failed(self, e);
            }
        }
    }

    /// Advance the handshake counters by the last transfer. Transmission
    /// runs to completion before the peer's header is read.
    fn nego_step(&self) -> NegoStep {
        let mut g = self.st.lock();
        let n = self.negoaio.count();
        if g.gottx < g.wanttx {
            g.gottx += n;
        } else if g.gotrx < g.wantrx {
            if let Some(buf) = self.negoaio.take_recv_buf() {
                let start = g.gotrx;
                let end = (start + n).min(HANDSHAKE_LEN);
                if end > start {
                    g.rxlen[start..end].copy_from_slice(&buf[..end - start]);
                }
            }
            g.gotrx += n;
        }
        if g.gottx < g.wanttx {
            return NegoStep::SendMore(Bytes::copy_from_slice(&g.txlen[g.gottx..]));
        }
        if g.gotrx < g.wantrx {
            return NegoStep::RecvMore(g.wantrx - g.gotrx);
        }
        let h = &g.rxlen;
        if h[0] != 0 || h[1] != b'S' || h[2] != b'P' || h[3] != 0 || h[6] != 0 || h[7] != 0 {
            return NegoStep::Fail(Error::Protocol);
        }
        g.peer = u16::from_be_bytes([h[4], h[5]]);
        NegoStep::Done
    }

    // ── Send path ───────────────────────────────────────────────────────

    pub(crate) fn send(self: &Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            // No way to hand the message back; drop it rather than leak.
            aio.take_msg();
            return;
        }
        let mut g = self.st.lock();
        if g.closed {
            drop(g);
            aio.finish_sync(Err(Error::Closed), 0);
            return;
        }
        if matches!(aio.timeout(), AioTimeout::Default) {
            if let Some(d) = g.send_timeout {
                aio.set_timeout(AioTimeout::After(d));
            }
        }
        let me = Arc::downgrade(self);
        let user = aio.clone();
        if let Err(e) = aio.schedule(move |err| {
            if let Some(p) = me.upgrade() {
                p.send_cancel(&user, err);
            }
        }) {
            drop(g);
            aio.finish_sync(Err(e), 0);
            return;
        }
        g.sendq.push_back(aio.clone());
        if g.sendq.len() == 1 && !g.tx_inflight {
            self.send_start(&mut g);
        }
    }

    /// Arm the transmitter for the head of the send queue: up to three
    /// gather segments (length header, message header, body).
    fn send_start(&self, g: &mut PipeState) {
        let Some(head) = g.sendq.front() else { return };
        let msg = head.take_msg().unwrap_or_default();
        g.tx_len = msg.len();
        g.txlen = (msg.len() as u64).to_be_bytes();
        let (header, body) = msg.into_parts();
        let mut iovs = Vec::with_capacity(3);
        iovs.push(Bytes::copy_from_slice(&g.txlen));
        if !header.is_empty() {
            iovs.push(header);
        }
        if !body.is_empty() {
            iovs.push(body);
        }
        self.txaio.set_iov(iovs);
        g.tx_inflight = true;
        self.conn.send(&self.txaio);
    }

    fn send_cb(self: &Arc<Self>) {
        let mut g = self.st.lock();
        g.tx_inflight = false;
        let Some(head) = g.sendq.front().cloned() else {
            return;
        };
        match self.txaio.result() {
            Err(e) => {
                // No next transfer is armed: after an error the stream is
                // almost certainly unusable mid-frame, and the protocol
                // layer is expected to close the pipe.
                g.sendq.pop_front();
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                drop(g);
                head.finish_sync(Err(e), 0);
            }
            Ok(()) => {
                let n = self.txaio.count();
                self.txaio.iov_advance(n);
                if self.txaio.iov_count() > 0 {
                    g.tx_inflight = true;
                    self.conn.send(&self.txaio);
                    return;
                }
                g.sendq.pop_front();
                let sent = g.tx_len;
                self.stats.tx_bytes.fetch_add(sent as u64, Ordering::Relaxed);
                drop(g);
                // Completion strictly happens-before the start of the next
                // queued send.
                head.finish_sync(Ok(()), sent);
                let mut g = self.st.lock();
                if !g.tx_inflight && !g.closed && !g.sendq.is_empty() {
                    self.send_start(&mut g);
                }
            }
        }
    }

    fn send_cancel(self: &Arc<Self>, user: &Arc<Aio>, err: Error) {
        let mut g = self.st.lock();
        let Some(pos) = g.sendq.iter().position(|a| Arc::ptr_eq(a, user)) else {
            return;
        };
        if pos == 0 && g.tx_inflight {
            // On the wire: cancel the transfer; its completion callback
            // propagates the error to the user AIO.
            self.txaio.abort(err);
            return;
        }
        g.sendq.remove(pos);
        drop(g);
        user.finish(Err(err), 0);
    }

    // ── Receive path ────────────────────────────────────────────────────

    pub(crate) fn recv(self: &Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            return;
        }
        let mut g = self.st.lock();
        if g.closed {
            drop(g);
            aio.finish_sync(Err(Error::Closed), 0);
            return;
        }
        if matches!(aio.timeout(), AioTimeout::Default) {
            if let Some(d) = g.recv_timeout {
                aio.set_timeout(AioTimeout::After(d));
            }
        }
        let me = Arc::downgrade(self);
        let user = aio.clone();
        if let Err(e) = aio.schedule(move |err| {
            if let Some(p) = me.upgrade() {
                p.recv_cancel(&user, err);
            }
        }) {
            drop(g);
            aio.finish_sync(Err(e), 0);
            return;
        }
        g.recvq.push_back(aio.clone());
        if g.recvq.len() == 1 && !g.rx_inflight {
            self.recv_start(&mut g);
        }
    }

    fn recv_start(&self, g: &mut PipeState) {
        debug_assert!(g.rx_len.is_none());
        if g.closed {
            return;
        }
        g.rx_got = 0;
        self.rxaio.set_recv_buf(BytesMut::zeroed(FRAME_HEADER_LEN));
        g.rx_inflight = true;
        self.conn.recv(&self.rxaio);
    }

    fn recv_cb(self: &Arc<Self>) {
        let mut g = self.st.lock();
        g.rx_inflight = false;
        let Some(head) = g.recvq.front().cloned() else {
            return;
        };
        match self.rxaio.result() {
            Err(e) => {
                // A clean close lands between frames; losing the stream
                // with part of a frame consumed is a peer violation.
                let e = if e == Error::Closed && g.rx_got > 0 {
                    Error::Protocol
                } else {
                    e
                };
                self.recv_fail(g, head, e);
            }
            Ok(()) => {
                let n = self.rxaio.count();
                g.rx_got += n;
                self.rxaio.iov_advance(n);
                if self.rxaio.iov_count() > 0 {
                    g.rx_inflight = true;
                    self.conn.recv(&self.rxaio);
                    return;
                }
                if g.rx_len.is_none() {
                    let Some(buf) = self.rxaio.take_recv_buf() else {
                        self.recv_fail(g, head, Error::Protocol);
                        return;
                    };
                    let mut lenb = [0u8; FRAME_HEADER_LEN];
                    lenb.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
                    let len = u64::from_be_bytes(lenb);
                    if g.rcvmax > 0 && len > g.rcvmax as u64 {
                        tracing::warn!(
                            pipe = self.id,
                            peer = %self.conn.peer_label(),
                            len,
                            limit = g.rcvmax,
                            "oversize message rejected"
                        );
                        self.recv_fail(g, head, Error::MessageTooBig);
                        return;
                    }
                    if len > 0 {
                        g.rx_len = Some(len as usize);
                        self.rxaio.set_recv_buf(BytesMut::zeroed(len as usize));
                        g.rx_inflight = true;
                        self.conn.recv(&self.rxaio);
                        return;
                    }
                    self.deliver(g, head, Message::new());
                } else {
                    let Some(body) = self.rxaio.take_recv_buf() else {
                        self.recv_fail(g, head, Error::Protocol);
                        return;
                    };
                    self.deliver(g, head, Message::from_body(body));
                }
            }
        }
    }

    fn deliver(&self, mut g: MutexGuard<'_, PipeState>, head: Arc<Aio>, msg: Message) {
        g.recvq.pop_front();
        g.rx_len = None;
        g.rx_got = 0;
        let n = msg.len();
        self.stats.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        drop(g);
        head.set_msg(msg);
        // Deliver before arming the next read so receive completions stay
        // serialized in queue order.
        head.finish_sync(Ok(()), n);
        let mut g = self.st.lock();
        if !g.rx_inflight && !g.closed && g.rx_len.is_none() && !g.recvq.is_empty() {
            self.recv_start(&mut g);
        }
    }

    fn recv_fail(&self, mut g: MutexGuard<'_, PipeState>, head: Arc<Aio>, err: Error) {
        // No next receive is armed; the protocol layer is expected to
        // notice the error and close the pipe.
        g.recvq.pop_front();
        g.rx_len = None;
        g.rx_got = 0;
        let _ = self.rxaio.take_recv_buf();
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        drop(g);
        head.finish_sync(Err(err), 0);
    }

    fn recv_cancel(self: &Arc<Self>, user: &Arc<Aio>, err: Error) {
        let mut g = self.st.lock();
        let Some(pos) = g.recvq.iter().position(|a| Arc::ptr_eq(a, user)) else {
            return;
        };
        if pos == 0 && g.rx_inflight {
            self.rxaio.abort(err);
            return;
        }
        g.recvq.remove(pos);
        drop(g);
        user.finish(Err(err), 0);
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Close the pipe's AIOs and stream. Idempotent. Queued requests that
    /// are not on the wire fail immediately with `Closed`; in-flight ones
    /// fail through their transfer's completion.
    pub(crate) fn close(&self) {
        let (send_drain, recv_drain) = {
            let mut g = self.st.lock();
            if g.closed {
                (Vec::new(), Vec::new())
            } else {
                g.closed = true;
                let tx_keep = usize::from(g.tx_inflight && !g.sendq.is_empty());
                let rx_keep = usize::from(g.rx_inflight && !g.recvq.is_empty());
                let sd: Vec<_> = g.sendq.split_off(tx_keep).into_iter().collect();
                let rd: Vec<_> = g.recvq.split_off(rx_keep).into_iter().collect();
                (sd, rd)
            }
        };
        self.txaio.close();
        self.rxaio.close();
        self.negoaio.close();
        self.conn.close();
        for aio in send_drain {
            aio.finish(Err(Error::Closed), 0);
        }
        for aio in recv_drain {
            aio.finish(Err(Error::Closed), 0);
        }
    }

    /// Join the three AIOs: returns once no callback can still be running.
    pub(crate) async fn stop(&self) {
        self.txaio.stop().await;
        self.rxaio.stop().await;
        self.negoaio.stop().await;
    }

    /// Schedule destruction. Single-shot; runs `fini` on the reap worker
    /// so teardown never joins an AIO from its own callback.
    pub(crate) fn reap(self: &Arc<Self>) {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close();
        let pipe = self.clone();
        reap::schedule(async move {
            pipe.fini().await;
        });
    }

    async fn fini(self: &Arc<Self>) {
        self.stop().await;
        if let Some(ep) = self.ep.upgrade() {
            ep.release_pipe(self);
        }
    }

    pub(crate) fn get_opt(&self, name: &str) -> Result<OptValue> {
        match name {
            names::REMOTE_ADDR => self
                .conn
                .peer_addr()
                .map(|a| OptValue::Str(a.to_string()))
                .ok_or(Error::NotSupported),
            names::LOCAL_ADDR => self
                .conn
                .local_addr()
                .map(|a| OptValue::Str(a.to_string()))
                .ok_or(Error::NotSupported),
            _ => Err(Error::NotSupported),
        }
    }
}

/// One end of an established, handshaken connection.
///
/// Handles are cheap to clone; the last teardown step happens on the reap
/// worker after [`Pipe::close`].
#[derive(Clone)]
pub struct Pipe {
    pub(crate) inner: Arc<PipeInner>,
}

impl Pipe {
    /// Process-unique pipe id.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// The peer's 16-bit protocol id, learned during the handshake.
    pub fn peer(&self) -> u16 {
        self.inner.peer()
    }

    /// Queue a message send. The AIO's message slot carries the payload;
    /// completion reports the number of bytes transferred. Sends complete
    /// in FIFO order.
    pub fn send(&self, aio: &Arc<Aio>) {
        self.inner.send(aio);
    }

    /// Queue a message receive. On success the AIO's message slot holds
    /// the reassembled message.
    pub fn recv(&self, aio: &Arc<Aio>) {
        self.inner.recv(aio);
    }

    /// Close the pipe and schedule its destruction. Idempotent.
    pub fn close(&self) {
        self.inner.reap();
    }

    /// Close, then wait until no pipe callback can still be running.
    pub async fn stop(&self) {
        self.inner.reap();
        self.inner.stop().await;
    }

    pub fn get_opt(&self, name: &str) -> Result<OptValue> {
        self.inner.get_opt(name)
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id())
            .field("peer", &self.inner.peer())
            .finish()
    }
}

//! The asynchronous I/O descriptor.
//!
//! An [`Aio`] is the unit of in-flight work: one submitted operation with a
//! gather list or receive buffer, an optional deadline, a cancellation
//! hook, and a completion callback. Lifecycle per submission:
//!
//! ```text
//! Idle -> Begun -> Scheduled -> (completing) -> Idle
//! ```
//!
//! The producer of work calls [`Aio::begin`], installs a cancel hook with
//! [`Aio::schedule`], and eventually completes the submission exactly once
//! with [`Aio::finish`] (callback dispatched to a fresh task) or
//! [`Aio::finish_sync`] (callback on the completing task). Between begin
//! and finish, [`Aio::abort`] routes an error through the cancel hook; the
//! hook and the completing side race, and whichever transitions the state
//! first wins. After completion the descriptor may be reused.
//!
//! Deadlines are armed at schedule time: a positive timeout spawns a timer
//! that fires the cancel hook with [`Error::TimedOut`]; a zero timeout
//! makes `schedule` fail fast with [`Error::Again`] (the non-blocking
//! submission path).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::msg::Message;
use crate::{Error, Result};

/// Deadline policy for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AioTimeout {
    /// No explicit deadline; the operation's owner may substitute its own
    /// default (e.g. a pipe's `recv-timeout` option).
    #[default]
    Default,
    /// Wait forever.
    Never,
    /// Expire after the given duration. A zero duration means
    /// "do not block at all".
    After(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Begun,
    Scheduled,
}

/// Transfer direction state: a gather list for sends, or a single receive
/// buffer with a fill cursor. Receives always use one buffer; sends gather
/// up to three segments (length header, message header, body).
enum Xfer {
    None,
    Tx(Vec<Bytes>),
    Rx { buf: BytesMut, filled: usize },
    /// Receive buffer temporarily detached by a stream provider.
    RxDetached,
}

type CancelFn = Box<dyn FnOnce(Error) + Send>;

struct Inner {
    state: State,
    closed: bool,
    /// Completions whose callback has not yet returned.
    cb_pending: u32,
    result: Result<()>,
    count: usize,
    timeout: AioTimeout,
    /// Bumped on every completion so a stale expiry timer is a no-op.
    expire_gen: u64,
    cancel: Option<CancelFn>,
    /// An abort that raced into the begin window, delivered at schedule.
    pending_abort: Option<Error>,
    xfer: Xfer,
    msg: Option<Message>,
    output: Option<Box<dyn Any + Send>>,
}

/// An asynchronous I/O descriptor. Always handled as `Arc<Aio>`.
pub struct Aio {
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
    inner: Mutex<Inner>,
    /// Serializes callback invocations: a resubmission made inside a
    /// callback may complete on another worker before the callback
    /// returns, and its callback must not overlap this one.
    cb_serial: Mutex<()>,
    done: Notify,
}

impl Aio {
    /// Create a descriptor whose completion callback is `cb`.
    ///
    /// The callback runs once per completed submission, serialized with
    /// respect to itself; callbacks of distinct descriptors run
    /// concurrently on the runtime.
    pub fn new(cb: impl Fn() + Send + Sync + 'static) -> Arc<Aio> {
        Aio::build(Some(Arc::new(cb)))
    }

    /// Create a descriptor with no callback; completion is observed with
    /// [`Aio::wait`] and [`Aio::result`].
    pub fn waitable() -> Arc<Aio> {
        Aio::build(None)
    }

    fn build(callback: Option<Arc<dyn Fn() + Send + Sync>>) -> Arc<Aio> {
        Arc::new(Aio {
            callback,
            cb_serial: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: State::Idle,
                closed: false,
                cb_pending: 0,
                result: Ok(()),
                count: 0,
                timeout: AioTimeout::Default,
                expire_gen: 0,
                cancel: None,
                pending_abort: None,
                xfer: Xfer::None,
                msg: None,
                output: None,
            }),
            done: Notify::new(),
        })
    }

    // ── Submission lifecycle ────────────────────────────────────────────

    /// Mark the descriptor in-flight. Fails if it has been closed, in
    /// which case the operation must not be submitted.
    pub fn begin(&self) -> Result<()> {
        let mut g = self.inner.lock();
        if g.closed {
            return Err(Error::Closed);
        }
        debug_assert_eq!(g.state, State::Idle, "aio submitted while in flight");
        g.state = State::Begun;
        g.result = Ok(());
        g.count = 0;
        g.pending_abort = None;
        Ok(())
    }

    /// Install the cancellation hook and arm the deadline.
    ///
    /// Returns an error without installing anything if the descriptor was
    /// closed or aborted in the begin window, or if the timeout is zero
    /// ([`Error::Again`]); the submitter then completes the descriptor
    /// with that error and does not start the operation.
    pub fn schedule(self: &Arc<Self>, cancel: impl FnOnce(Error) + Send + 'static) -> Result<()> {
        let mut g = self.inner.lock();
        debug_assert_eq!(g.state, State::Begun, "schedule without begin");
        if g.closed {
            return Err(Error::Closed);
        }
        if let Some(e) = g.pending_abort.take() {
            return Err(e);
        }
        if let AioTimeout::After(d) = g.timeout {
            if d.is_zero() {
                return Err(Error::Again);
            }
        }
        g.cancel = Some(Box::new(cancel));
        g.state = State::Scheduled;
        if let AioTimeout::After(d) = g.timeout {
            let gen = g.expire_gen;
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                if let Some(aio) = weak.upgrade() {
                    aio.expire(gen);
                }
            });
        }
        Ok(())
    }

    fn expire(&self, gen: u64) {
        let cancel = {
            let mut g = self.inner.lock();
            if g.state != State::Scheduled || g.expire_gen != gen {
                return;
            }
            g.cancel.take()
        };
        if let Some(c) = cancel {
            c(Error::TimedOut);
        }
    }

    /// Request cancellation with the given error. Invokes the cancel hook
    /// at most once; a second abort, or an abort after completion, is a
    /// no-op.
    pub fn abort(&self, err: Error) {
        let cancel = {
            let mut g = self.inner.lock();
            match g.state {
                State::Scheduled => g.cancel.take(),
                State::Begun => {
                    g.pending_abort = Some(err);
                    None
                }
                State::Idle => None,
            }
        };
        if let Some(c) = cancel {
            c(err);
        }
    }

    /// Close the descriptor: abort any pending submission with
    /// [`Error::Closed`] and refuse future ones. Idempotent.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.abort(Error::Closed);
    }

    /// Close, then wait for the in-flight submission (and its callback) to
    /// drain.
    pub async fn stop(&self) {
        self.close();
        self.wait().await;
    }

    /// Wait until the descriptor is idle: no submission in flight and no
    /// callback running.
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            {
                let g = self.inner.lock();
                if g.state == State::Idle && g.cb_pending == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Complete the submission; the callback is dispatched to a fresh
    /// task. Safe to call with locks held.
    pub fn finish(self: &Arc<Self>, result: Result<()>, count: usize) {
        if !self.finish_prep(result, count) {
            return;
        }
        let aio = self.clone();
        tokio::spawn(async move {
            aio.run_callback();
        });
    }

    /// Complete the submission and run the callback on the calling task.
    /// The caller must not hold any lock the callback may take.
    pub fn finish_sync(self: &Arc<Self>, result: Result<()>, count: usize) {
        if !self.finish_prep(result, count) {
            return;
        }
        self.run_callback();
    }

    fn finish_prep(&self, result: Result<()>, count: usize) -> bool {
        let mut g = self.inner.lock();
        if g.state == State::Idle {
            // Lost the completion race; the other side already finished.
            return false;
        }
        g.state = State::Idle;
        g.expire_gen = g.expire_gen.wrapping_add(1);
        g.cancel = None;
        g.result = result;
        g.count = count;
        g.cb_pending += 1;
        true
    }

    fn run_callback(&self) {
        {
            let _serial = self.cb_serial.lock();
            if let Some(cb) = &self.callback {
                cb();
            }
        }
        self.inner.lock().cb_pending -= 1;
        self.done.notify_waiters();
    }

    // ── Completion status ───────────────────────────────────────────────

    /// Result of the last completed submission.
    pub fn result(&self) -> Result<()> {
        self.inner.lock().result
    }

    /// Bytes transferred by the last completed submission.
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    // ── Deadline ────────────────────────────────────────────────────────

    pub fn set_timeout(&self, t: AioTimeout) {
        self.inner.lock().timeout = t;
    }

    pub fn timeout(&self) -> AioTimeout {
        self.inner.lock().timeout
    }

    // ── Buffers ─────────────────────────────────────────────────────────

    /// Arm a gather list for a send.
    pub fn set_iov(&self, bufs: Vec<Bytes>) {
        self.inner.lock().xfer = Xfer::Tx(bufs);
    }

    /// Arm a receive buffer; its full length is the wanted byte count.
    pub fn set_recv_buf(&self, buf: BytesMut) {
        self.inner.lock().xfer = Xfer::Rx { buf, filled: 0 };
    }

    /// Consume `n` transferred bytes: drops sent prefixes from the gather
    /// list, or advances the receive fill cursor. Used by frame handlers
    /// to resubmit after a partial transfer without rebuilding buffers.
    pub fn iov_advance(&self, mut n: usize) {
        use bytes::Buf;
        let mut g = self.inner.lock();
        match &mut g.xfer {
            Xfer::Tx(bufs) => {
                while n > 0 {
                    let Some(front) = bufs.first_mut() else { break };
                    if front.len() > n {
                        front.advance(n);
                        break;
                    }
                    n -= front.len();
                    bufs.remove(0);
                }
            }
            Xfer::Rx { buf, filled } => {
                *filled = (*filled + n).min(buf.len());
            }
            Xfer::None | Xfer::RxDetached => {}
        }
    }

    /// Remaining transfer segments: gather entries still to send, or 1
    /// while the receive buffer is not full.
    pub fn iov_count(&self) -> usize {
        let g = self.inner.lock();
        match &g.xfer {
            Xfer::Tx(bufs) => bufs.iter().filter(|b| !b.is_empty()).count(),
            Xfer::Rx { buf, filled } => usize::from(*filled < buf.len()),
            Xfer::None | Xfer::RxDetached => 0,
        }
    }

    /// Snapshot of the remaining gather entries (stream provider side).
    pub fn tx_slices(&self) -> Vec<Bytes> {
        match &self.inner.lock().xfer {
            Xfer::Tx(bufs) => bufs.clone(),
            _ => Vec::new(),
        }
    }

    /// Detach the receive buffer and fill cursor for the duration of one
    /// transfer attempt (stream provider side).
    pub fn detach_rx(&self) -> Option<(BytesMut, usize)> {
        let mut g = self.inner.lock();
        match std::mem::replace(&mut g.xfer, Xfer::RxDetached) {
            Xfer::Rx { buf, filled } => Some((buf, filled)),
            other => {
                g.xfer = other;
                None
            }
        }
    }

    /// Reattach a receive buffer after a transfer attempt.
    pub fn attach_rx(&self, buf: BytesMut, filled: usize) {
        self.inner.lock().xfer = Xfer::Rx { buf, filled };
    }

    /// Take the completed receive buffer (consumer side).
    pub fn take_recv_buf(&self) -> Option<BytesMut> {
        let mut g = self.inner.lock();
        match std::mem::replace(&mut g.xfer, Xfer::None) {
            Xfer::Rx { buf, .. } => Some(buf),
            other => {
                g.xfer = other;
                None
            }
        }
    }

    // ── Payload and output slots ────────────────────────────────────────

    pub fn set_msg(&self, msg: Message) {
        self.inner.lock().msg = Some(msg);
    }

    pub fn take_msg(&self) -> Option<Message> {
        self.inner.lock().msg.take()
    }

    /// Store a typed output (a connected stream, a matched pipe, a
    /// resolved address).
    pub fn set_output<T: Any + Send>(&self, value: T) {
        self.inner.lock().output = Some(Box::new(value));
    }

    /// Take the typed output, if one of type `T` is present.
    pub fn take_output<T: Any + Send>(&self) -> Option<T> {
        let boxed = self.inner.lock().output.take()?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }
}

impl std::fmt::Debug for Aio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock();
        f.debug_struct("Aio")
            .field("state", &g.state)
            .field("closed", &g.closed)
            .field("result", &g.result)
            .field("count", &g.count)
            .finish()
    }
}

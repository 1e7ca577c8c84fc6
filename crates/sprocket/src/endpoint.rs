//! The endpoint engine: one dialing or listening identity.
//!
//! An endpoint owns a stream dialer or a stream listener, runs the
//! connect/accept loop, supervises pipe handshakes, and matches finished
//! pipes with the user's pending connect/accept request. Pipes move
//! through three phase lists (negotiating, waiting, busy) and the
//! endpoint's reference count tracks every pipe on any of them; final
//! teardown waits (via the reap worker) until the count drains to zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use sprocket_core::{Aio, Error, OptValue, Result, Url, names, next_id, reap};
use sprocket_stream::resolve::sleep_aio;
use sprocket_stream::{Connection, StreamDialer, StreamListener, TlsConfig};

use crate::pipe::{Pipe, PipeInner};

/// Cool-off before re-arming accept after descriptor or memory
/// exhaustion.
const ACCEPT_COOLOFF: Duration = Duration::from_millis(10);

const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(100);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(5);

/// Receive ceilings above 4 GiB are rejected outright.
const MAX_RECV_SIZE: u64 = 1 << 32;

pub(crate) struct EpState {
    started: bool,
    bound: bool,
    closed: bool,
    fini: bool,
    redialing: bool,
    refcnt: usize,
    rcvmax: usize,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    reconnect_min: Duration,
    reconnect_max: Duration,
    useraio: Option<Arc<Aio>>,
    negopipes: Vec<Arc<PipeInner>>,
    waitpipes: Vec<Arc<PipeInner>>,
    busypipes: Vec<Arc<PipeInner>>,
}

pub(crate) struct Ep {
    id: u64,
    url: Url,
    proto: u16,
    dialer: Option<Arc<dyn StreamDialer>>,
    listener: Option<Arc<dyn StreamListener>>,
    connaio: Arc<Aio>,
    timeaio: Arc<Aio>,
    reaped: AtomicBool,
    st: Mutex<EpState>,
}

impl Ep {
    pub(crate) fn new_dialer(url: Url, proto: u16, dialer: Arc<dyn StreamDialer>) -> Arc<Ep> {
        Ep::build(url, proto, Some(dialer), None)
    }

    pub(crate) fn new_listener(url: Url, proto: u16, listener: Arc<dyn StreamListener>) -> Arc<Ep> {
        Ep::build(url, proto, None, Some(listener))
    }

    fn build(
        url: Url,
        proto: u16,
        dialer: Option<Arc<dyn StreamDialer>>,
        listener: Option<Arc<dyn StreamListener>>,
    ) -> Arc<Ep> {
        let is_dialer = dialer.is_some();
        Arc::new_cyclic(|weak: &Weak<Ep>| {
            let w = weak.clone();
            let connaio = Aio::new(move || {
                if let Some(ep) = w.upgrade() {
                    if is_dialer {
                        ep.dial_cb();
                    } else {
                        ep.accept_cb();
                    }
                }
            });
            let w = weak.clone();
            let timeaio = Aio::new(move || {
                if let Some(ep) = w.upgrade() {
                    ep.timer_cb();
                }
            });
            Ep {
                id: next_id(),
                url,
                proto,
                dialer,
                listener,
                connaio,
                timeaio,
                reaped: AtomicBool::new(false),
                st: Mutex::new(EpState {
                    started: false,
                    bound: false,
                    closed: false,
                    fini: false,
                    redialing: false,
                    refcnt: 0,
                    rcvmax: 0,
                    send_timeout: None,
                    recv_timeout: None,
                    reconnect_min: DEFAULT_RECONNECT_MIN,
                    reconnect_max: DEFAULT_RECONNECT_MAX,
                    useraio: None,
                    negopipes: Vec::new(),
                    waitpipes: Vec::new(),
                    busypipes: Vec::new(),
                }),
            }
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    // ── User connect / accept ───────────────────────────────────────────

    /// Submit a user connect request. At most one user request may be
    /// pending; a second fails fast with `Busy`.
    pub(crate) fn connect(self: &Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            return;
        }
        let mut g = self.st.lock();
        if g.closed {
            drop(g);
            aio.finish_sync(Err(Error::Closed), 0);
            return;
        }
        if g.useraio.is_some() {
            drop(g);
            aio.finish_sync(Err(Error::Busy), 0);
            return;
        }
        let me = Arc::downgrade(self);
        let user = aio.clone();
        if let Err(e) = aio.schedule(move |err| {
            if let Some(ep) = me.upgrade() {
                ep.cancel_user(&user, err);
            }
        }) {
            drop(g);
            aio.finish_sync(Err(e), 0);
            return;
        }
        g.useraio = Some(aio.clone());
        if !g.waitpipes.is_empty() {
            // A background-dialed pipe is already parked.
            self.match_pipe(&mut g);
            return;
        }
        drop(g);
        if let Some(d) = &self.dialer {
            d.clone().dial(&self.connaio);
        }
    }

    /// Submit a user accept request. The listener's accept loop is armed
    /// on the first request; later requests just wait for a match.
    pub(crate) fn accept(self: &Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            return;
        }
        let mut g = self.st.lock();
        if g.closed {
            drop(g);
            aio.finish_sync(Err(Error::Closed), 0);
            return;
        }
        if !g.bound {
            drop(g);
            aio.finish_sync(Err(Error::InvalidState), 0);
            return;
        }
        if g.useraio.is_some() {
            drop(g);
            aio.finish_sync(Err(Error::Busy), 0);
            return;
        }
        let me = Arc::downgrade(self);
        let user = aio.clone();
        if let Err(e) = aio.schedule(move |err| {
            if let Some(ep) = me.upgrade() {
                ep.cancel_user(&user, err);
            }
        }) {
            drop(g);
            aio.finish_sync(Err(e), 0);
            return;
        }
        g.useraio = Some(aio.clone());
        if !g.started {
            g.started = true;
            drop(g);
            if let Some(l) = &self.listener {
                l.clone().accept(&self.connaio);
            }
        } else {
            self.match_pipe(&mut g);
        }
    }

    fn cancel_user(self: &Arc<Self>, user: &Arc<Aio>, err: Error) {
        let taken = {
            let mut g = self.st.lock();
            match &g.useraio {
                Some(cur) if Arc::ptr_eq(cur, user) => g.useraio.take(),
                _ => None,
            }
        };
        if let Some(aio) = taken {
            aio.finish(Err(err), 0);
        }
    }

    fn fail_user(&self, err: Error) {
        let taken = self.st.lock().useraio.take();
        if let Some(aio) = taken {
            aio.finish(Err(err), 0);
        }
    }

    // ── Stream factory completions ──────────────────────────────────────

    fn dial_cb(self: &Arc<Self>) {
        match self.connaio.result() {
            Ok(()) => match self.connaio.take_output::<Arc<Connection>>() {
                Some(conn) => self.start_pipe(conn),
                None => self.fail_user(Error::Invalid),
            },
            Err(e) => self.fail_user(e),
        }
    }

    fn accept_cb(self: &Arc<Self>) {
        match self.connaio.result() {
            Ok(()) => {
                match self.connaio.take_output::<Arc<Connection>>() {
                    Some(conn) => self.start_pipe(conn),
                    None => self.fail_user(Error::Invalid),
                }
                // Re-arm at once so handshake cost stays off the accept
                // loop.
                let closed = self.st.lock().closed;
                if !closed {
                    if let Some(l) = &self.listener {
                        l.clone().accept(&self.connaio);
                    }
                }
            }
            Err(e) => self.accept_error(e),
        }
    }

    fn accept_error(self: &Arc<Self>, err: Error) {
        self.fail_user(err);
        match err {
            // Resource exhaustion: cool off instead of spinning.
            Error::NoMemory | Error::NoFiles => sleep_aio(ACCEPT_COOLOFF, &self.timeaio),
            _ => {
                let closed = self.st.lock().closed;
                if !closed {
                    if let Some(l) = &self.listener {
                        l.clone().accept(&self.connaio);
                    }
                }
            }
        }
    }

    fn timer_cb(self: &Arc<Self>) {
        if self.timeaio.result().is_err() {
            return;
        }
        let closed = self.st.lock().closed;
        if !closed {
            if let Some(l) = &self.listener {
                l.clone().accept(&self.connaio);
            }
        }
    }

    /// Register a new pipe and launch its handshake.
    fn start_pipe(self: &Arc<Self>, conn: Arc<Connection>) {
        let pipe = PipeInner::new(conn.clone(), self.proto, self);
        {
            let mut g = self.st.lock();
            if g.closed {
                drop(g);
                conn.close();
                self.fail_user(Error::Closed);
                return;
            }
            g.refcnt += 1;
            g.negopipes.push(pipe.clone());
        }
        pipe.start();
    }

    // ── Handshake outcomes ──────────────────────────────────────────────

    pub(crate) fn handshake_done(self: &Arc<Self>, pipe: &Arc<PipeInner>) {
        let mut g = self.st.lock();
        let Some(pos) = g.negopipes.iter().position(|p| Arc::ptr_eq(p, pipe)) else {
            return;
        };
        let p = g.negopipes.remove(pos);
        g.waitpipes.push(p);
        self.match_pipe(&mut g);
    }

    pub(crate) fn handshake_failed(self: &Arc<Self>, pipe: &Arc<PipeInner>, err: Error) {
        {
            let mut g = self.st.lock();
            if let Some(pos) = g.negopipes.iter().position(|p| Arc::ptr_eq(p, pipe)) {
                g.negopipes.remove(pos);
            } else {
                return;
            }
        }
        self.fail_user(err);
        pipe.reap();
    }

    /// The only place a handshake-complete pipe becomes visible: pair the
    /// pending user request with the oldest waiting pipe.
    fn match_pipe(&self, g: &mut EpState) {
        if g.waitpipes.is_empty() || g.useraio.is_none() {
            return;
        }
        let Some(aio) = g.useraio.take() else { return };
        let pipe = g.waitpipes.remove(0);
        pipe.imprint(g.rcvmax, g.send_timeout, g.recv_timeout);
        g.busypipes.push(pipe.clone());
        aio.set_output(Pipe { inner: pipe });
        aio.finish(Ok(()), 0);
    }

    // ── Background redial ───────────────────────────────────────────────

    /// Start dialing in the background with exponential backoff between
    /// `reconnect-time-min` and `reconnect-time-max`. The established
    /// pipe parks on the waiting list until a user connect claims it.
    pub(crate) fn start_redial(self: &Arc<Self>) -> Result<()> {
        let (min, max) = {
            let mut g = self.st.lock();
            if g.closed {
                return Err(Error::Closed);
            }
            if g.redialing {
                return Err(Error::InvalidState);
            }
            g.redialing = true;
            (g.reconnect_min, g.reconnect_max)
        };
        let Some(dialer) = self.dialer.clone() else {
            self.st.lock().redialing = false;
            return Err(Error::NotSupported);
        };
        let ep = self.clone();
        tokio::spawn(async move {
            let mut backoff = min.max(Duration::from_millis(1));
            loop {
                if ep.st.lock().closed {
                    break;
                }
                let aio = Aio::waitable();
                dialer.clone().dial(&aio);
                aio.wait().await;
                match aio.result() {
                    Ok(()) => {
                        if let Some(conn) = aio.take_output::<Arc<Connection>>() {
                            ep.start_pipe(conn);
                        }
                        break;
                    }
                    Err(Error::Closed) => break,
                    Err(e) => {
                        tracing::debug!(endpoint = ep.id, err = %e, "redial failed, backing off");
                        tokio::time::sleep(backoff).await;
                        let cap = if max.is_zero() { min } else { max };
                        backoff = (backoff * 2).min(cap.max(min));
                    }
                }
            }
            ep.st.lock().redialing = false;
        });
        Ok(())
    }

    // ── Bind ────────────────────────────────────────────────────────────

    pub(crate) async fn bind(self: &Arc<Self>) -> Result<()> {
        {
            let g = self.st.lock();
            if g.closed {
                return Err(Error::Closed);
            }
            if g.bound {
                return Err(Error::InvalidState);
            }
        }
        let Some(l) = self.listener.clone() else {
            return Err(Error::NotSupported);
        };
        l.listen().await?;
        self.st.lock().bound = true;
        Ok(())
    }

    // ── Options ─────────────────────────────────────────────────────────

    pub(crate) fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        match name {
            names::RECV_MAX_SIZE => {
                let v = value.as_size().ok_or(Error::BadType)?;
                if v as u64 > MAX_RECV_SIZE {
                    // Reject; the previous ceiling stays in force.
                    return Err(Error::Invalid);
                }
                self.st.lock().rcvmax = v;
                Ok(())
            }
            names::SEND_TIMEOUT
            | names::RECV_TIMEOUT
            | names::RECONNECT_MIN
            | names::RECONNECT_MAX => {
                let ms = value.as_ms().ok_or(Error::BadType)?;
                if ms < 0 {
                    return Err(Error::Invalid);
                }
                let d = Duration::from_millis(ms as u64);
                let mut g = self.st.lock();
                match name {
                    names::SEND_TIMEOUT => g.send_timeout = Some(d),
                    names::RECV_TIMEOUT => g.recv_timeout = Some(d),
                    names::RECONNECT_MIN => g.reconnect_min = d,
                    _ => g.reconnect_max = d,
                }
                Ok(())
            }
            names::URL => Err(Error::NotSupported),
            _ => match (&self.dialer, &self.listener) {
                (Some(d), _) => d.set_opt(name, value),
                (_, Some(l)) => l.set_opt(name, value),
                _ => Err(Error::NotSupported),
            },
        }
    }

    pub(crate) fn get_opt(&self, name: &str) -> Result<OptValue> {
        match name {
            names::RECV_MAX_SIZE => Ok(OptValue::Size(self.st.lock().rcvmax)),
            names::URL => {
                let url = match self.listener.as_ref().and_then(|l| l.bound_port()) {
                    Some(port) => self.url.with_port(port),
                    None => self.url.clone(),
                };
                Ok(OptValue::Str(url.to_string()))
            }
            names::SEND_TIMEOUT => Ok(OptValue::Ms(ms_of(self.st.lock().send_timeout))),
            names::RECV_TIMEOUT => Ok(OptValue::Ms(ms_of(self.st.lock().recv_timeout))),
            names::RECONNECT_MIN => Ok(OptValue::Ms(self.st.lock().reconnect_min.as_millis() as i64)),
            names::RECONNECT_MAX => Ok(OptValue::Ms(self.st.lock().reconnect_max.as_millis() as i64)),
            _ => match (&self.dialer, &self.listener) {
                (Some(d), _) => d.get_opt(name),
                (_, Some(l)) => l.get_opt(name),
                _ => Err(Error::NotSupported),
            },
        }
    }

    pub(crate) fn set_tls(&self, cfg: TlsConfig) -> Result<()> {
        match (&self.dialer, &self.listener) {
            (Some(d), _) => d.set_tls(cfg),
            (_, Some(l)) => l.set_tls(cfg),
            _ => Err(Error::NotSupported),
        }
    }

    pub(crate) fn get_tls(&self) -> Result<TlsConfig> {
        match (&self.dialer, &self.listener) {
            (Some(d), _) => d.get_tls(),
            (_, Some(l)) => l.get_tls(),
            _ => Err(Error::NotSupported),
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Close the endpoint: stop the factory, close every pipe on every
    /// phase list, and fail any pending user request. Idempotent.
    pub(crate) fn close(&self) {
        let (pipes, user) = {
            let mut g = self.st.lock();
            if g.closed {
                return;
            }
            g.closed = true;
            let mut pipes = Vec::new();
            pipes.extend(g.negopipes.iter().cloned());
            pipes.extend(g.waitpipes.iter().cloned());
            pipes.extend(g.busypipes.iter().cloned());
            (pipes, g.useraio.take())
        };
        self.timeaio.close();
        if let Some(d) = &self.dialer {
            d.close();
        }
        if let Some(l) = &self.listener {
            l.close();
        }
        for p in &pipes {
            p.reap();
        }
        if let Some(aio) = user {
            aio.finish(Err(Error::Closed), 0);
        }
    }

    /// Begin final teardown. Destruction is deferred until the last pipe
    /// has been reaped.
    pub(crate) fn fini(self: &Arc<Self>) {
        self.close();
        let ready = {
            let mut g = self.st.lock();
            g.fini = true;
            g.refcnt == 0
        };
        if ready {
            self.reap();
        }
    }

    fn reap(self: &Arc<Self>) {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return;
        }
        let ep = self.clone();
        reap::schedule(async move {
            ep.timeaio.stop().await;
            ep.connaio.stop().await;
        });
    }

    /// Called from pipe teardown: drop the pipe from whichever phase list
    /// holds it and release its reference. The last release of a
    /// finalized endpoint schedules the endpoint's own reap.
    pub(crate) fn release_pipe(self: &Arc<Self>, pipe: &Arc<PipeInner>) {
        let reap_ep = {
            let mut g = self.st.lock();
            if let Some(pos) = g.negopipes.iter().position(|p| Arc::ptr_eq(p, pipe)) {
                g.negopipes.remove(pos);
            } else if let Some(pos) = g.waitpipes.iter().position(|p| Arc::ptr_eq(p, pipe)) {
                g.waitpipes.remove(pos);
            } else if let Some(pos) = g.busypipes.iter().position(|p| Arc::ptr_eq(p, pipe)) {
                g.busypipes.remove(pos);
            }
            g.refcnt = g.refcnt.saturating_sub(1);
            g.fini && g.refcnt == 0
        };
        if reap_ep {
            self.reap();
        }
    }

    #[cfg(test)]
    pub(crate) fn debug_counts(&self) -> (usize, usize, usize, usize) {
        let g = self.st.lock();
        (
            g.refcnt,
            g.negopipes.len(),
            g.waitpipes.len(),
            g.busypipes.len(),
        )
    }
}

fn ms_of(d: Option<Duration>) -> i64 {
    // -1 mirrors "no deadline configured"; set_opt rejects negatives, so
    // the sentinel cannot be confused with stored state.
    d.map(|d| d.as_millis() as i64).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_listener(url: &str) -> (crate::Listener, String) {
        let listener = crate::listen(url, 0x0501).await.unwrap();
        listener.bind().await.unwrap();
        let bound = listener
            .get_opt(names::URL)
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();
        (listener, bound)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refcount_matches_phase_lists() {
        let (listener, _url) = bound_listener("inproc://refcount-check").await;

        let accept_aio = Aio::waitable();
        listener.accept(&accept_aio);

        let dialer = crate::dial("inproc://refcount-check", 0x0501).unwrap();
        let dial_aio = Aio::waitable();
        dialer.connect(&dial_aio);

        dial_aio.wait().await;
        accept_aio.wait().await;
        assert_eq!(dial_aio.result(), Ok(()));
        assert_eq!(accept_aio.result(), Ok(()));

        let (refcnt, nego, wait, busy) = listener.ep.debug_counts();
        assert_eq!(refcnt, nego + wait + busy);
        assert_eq!(busy, 1);

        let (refcnt, nego, wait, busy) = dialer.ep.debug_counts();
        assert_eq!(refcnt, nego + wait + busy);
        assert_eq!(busy, 1);

        dialer.close();
        listener.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_user_request_is_busy() {
        let (listener, _url) = bound_listener("inproc://busy-check").await;

        let first = Aio::waitable();
        listener.accept(&first);
        let second = Aio::waitable();
        listener.accept(&second);
        second.wait().await;
        assert_eq!(second.result(), Err(Error::Busy));

        listener.close();
        first.wait().await;
        assert_eq!(first.result(), Err(Error::Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_and_fails_pending_user() {
        let (listener, _url) = bound_listener("inproc://close-twice").await;
        let aio = Aio::waitable();
        listener.accept(&aio);
        listener.close();
        listener.close();
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::Closed));

        let late = Aio::waitable();
        listener.accept(&late);
        late.wait().await;
        assert_eq!(late.result(), Err(Error::Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accept_before_bind_is_invalid_state() {
        let listener = crate::listen("inproc://no-bind", 1).await.unwrap();
        let aio = Aio::waitable();
        listener.accept(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::InvalidState));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn canceling_pending_accept_clears_the_slot() {
        let (listener, _url) = bound_listener("inproc://cancel-accept").await;
        let aio = Aio::waitable();
        listener.accept(&aio);
        aio.abort(Error::Canceled);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::Canceled));

        // The slot is free again.
        let again = Aio::waitable();
        listener.accept(&again);
        again.abort(Error::Canceled);
        again.wait().await;
        assert_eq!(again.result(), Err(Error::Canceled));
        listener.close();
    }
}

//! TCP stream dialer and listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sprocket_core::{Aio, Error, OptValue, Result, names};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};

use crate::conn::Connection;
use crate::resolve::{Family, resolve};
use crate::{StreamDialer, StreamListener};

/// Socket options shared by the dialer and listener.
#[derive(Default)]
struct TcpOpts {
    nodelay: AtomicBool,
    keepalive: AtomicBool,
}

impl TcpOpts {
    fn set(&self, name: &str, value: &OptValue) -> Result<()> {
        let v = value.as_bool().ok_or(Error::BadType);
        match name {
            names::TCP_NODELAY => self.nodelay.store(v?, Ordering::Relaxed),
            names::TCP_KEEPALIVE => self.keepalive.store(v?, Ordering::Relaxed),
            _ => return Err(Error::NotSupported),
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Result<OptValue> {
        match name {
            names::TCP_NODELAY => Ok(OptValue::Bool(self.nodelay.load(Ordering::Relaxed))),
            names::TCP_KEEPALIVE => Ok(OptValue::Bool(self.keepalive.load(Ordering::Relaxed))),
            _ => Err(Error::NotSupported),
        }
    }

    fn apply(&self, stream: &TcpStream) {
        if self.nodelay.load(Ordering::Relaxed) {
            let _ = stream.set_nodelay(true);
        }
        if self.keepalive.load(Ordering::Relaxed) {
            set_keepalive(stream);
        }
    }
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream) {}

pub(crate) fn connection_for(stream: TcpStream) -> Arc<Connection> {
    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();
    let label = peer
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Connection::from_stream(stream, local, peer, label)
}

// ── Dialer ──────────────────────────────────────────────────────────────

pub struct TcpDialer {
    host: String,
    port: u16,
    family: Family,
    opts: TcpOpts,
    closed: AtomicBool,
}

impl TcpDialer {
    pub fn new(host: String, port: u16, family: Family) -> Arc<TcpDialer> {
        Arc::new(TcpDialer {
            host,
            port,
            family,
            opts: TcpOpts::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) async fn connect(&self) -> Result<TcpStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let addr = resolve(&self.host, self.port, self.family).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::from_io(&e))?;
        self.opts.apply(&stream);
        Ok(stream)
    }
}

impl StreamDialer for TcpDialer {
    fn dial(self: Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            return;
        }
        let (hook, mut canceled) = oneshot::channel::<Error>();
        if let Err(e) = aio.schedule(move |err| {
            let _ = hook.send(err);
        }) {
            aio.finish_sync(Err(e), 0);
            return;
        }
        let aio = aio.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                biased;
                Ok(err) = &mut canceled => Err(err),
                r = self.connect() => r,
            };
            match res {
                Ok(stream) => {
                    aio.set_output(connection_for(stream));
                    aio.finish_sync(Ok(()), 0);
                }
                Err(e) => aio.finish_sync(Err(e), 0),
            }
        });
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        self.opts.set(name, value)
    }

    fn get_opt(&self, name: &str) -> Result<OptValue> {
        self.opts.get(name)
    }
}

// ── Listener ────────────────────────────────────────────────────────────

enum ListenState {
    Unbound,
    Bound(Arc<TcpListener>),
    Closed,
}

pub struct TcpStreamListener {
    addr: SocketAddr,
    state: Mutex<ListenState>,
    bound_port: Mutex<Option<u16>>,
    opts: TcpOpts,
    closed: AtomicBool,
    close_notify: Notify,
}

impl TcpStreamListener {
    /// The address must already be resolved; listener-side resolution
    /// happens once at endpoint init.
    pub fn new(addr: SocketAddr) -> Arc<TcpStreamListener> {
        Arc::new(TcpStreamListener {
            addr,
            state: Mutex::new(ListenState::Unbound),
            bound_port: Mutex::new(None),
            opts: TcpOpts::default(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    async fn bind(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !matches!(*self.state.lock(), ListenState::Unbound) {
            return Err(Error::InvalidState);
        }
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::from_io(&e))?;
        let port = listener.local_addr().ok().map(|a| a.port());
        let mut st = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !matches!(*st, ListenState::Unbound) {
            return Err(Error::InvalidState);
        }
        *st = ListenState::Bound(Arc::new(listener));
        *self.bound_port.lock() = port;
        Ok(())
    }

    pub(crate) async fn accept_stream(
        self: &Arc<Self>,
        canceled: &mut oneshot::Receiver<Error>,
    ) -> Result<TcpStream> {
        let listener = match &*self.state.lock() {
            ListenState::Bound(l) => l.clone(),
            ListenState::Unbound => return Err(Error::InvalidState),
            ListenState::Closed => return Err(Error::Closed),
        };
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let stream = tokio::select! {
            biased;
            Ok(err) = canceled => return Err(err),
            _ = &mut notified => return Err(Error::Closed),
            r = listener.accept() => r.map_err(|e| Error::from_io(&e))?.0,
        };
        self.opts.apply(&stream);
        Ok(stream)
    }
}

impl StreamListener for TcpStreamListener {
    fn listen(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { self.bind().await })
    }

    fn accept(self: Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            return;
        }
        let (hook, mut canceled) = oneshot::channel::<Error>();
        if let Err(e) = aio.schedule(move |err| {
            let _ = hook.send(err);
        }) {
            aio.finish_sync(Err(e), 0);
            return;
        }
        let aio = aio.clone();
        tokio::spawn(async move {
            match self.accept_stream(&mut canceled).await {
                Ok(stream) => {
                    aio.set_output(connection_for(stream));
                    aio.finish_sync(Ok(()), 0);
                }
                Err(e) => aio.finish_sync(Err(e), 0),
            }
        });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = ListenState::Closed;
        self.close_notify.notify_waiters();
    }

    fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock()
    }

    fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        self.opts.set(name, value)
    }

    fn get_opt(&self, name: &str) -> Result<OptValue> {
        match name {
            names::LOCAL_ADDR => {
                let port = self.bound_port().unwrap_or(self.addr.port());
                let mut addr = self.addr;
                addr.set_port(port);
                Ok(OptValue::Str(addr.to_string()))
            }
            _ => self.opts.get(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_and_accept_round_trip() {
        let listener = TcpStreamListener::new("127.0.0.1:0".parse().unwrap());
        listener.clone().listen().await.unwrap();
        let port = listener.bound_port().unwrap();

        let accept_aio = Aio::waitable();
        listener.clone().accept(&accept_aio);

        let dialer = TcpDialer::new("127.0.0.1".into(), port, Family::V4);
        let dial_aio = Aio::waitable();
        dialer.dial(&dial_aio);

        dial_aio.wait().await;
        accept_aio.wait().await;
        assert_eq!(dial_aio.result(), Ok(()));
        assert_eq!(accept_aio.result(), Ok(()));
        assert!(dial_aio.take_output::<Arc<Connection>>().is_some());
        assert!(accept_aio.take_output::<Arc<Connection>>().is_some());
    }

    #[tokio::test]
    async fn second_bind_same_port_is_in_use() {
        let first = TcpStreamListener::new("127.0.0.1:0".parse().unwrap());
        first.clone().listen().await.unwrap();
        let port = first.bound_port().unwrap();

        let second = TcpStreamListener::new(format!("127.0.0.1:{port}").parse().unwrap());
        assert_eq!(second.listen().await, Err(Error::AddressInUse));
    }

    #[tokio::test]
    async fn double_listen_is_invalid_state() {
        let l = TcpStreamListener::new("127.0.0.1:0".parse().unwrap());
        l.clone().listen().await.unwrap();
        assert_eq!(l.listen().await, Err(Error::InvalidState));
    }

    #[tokio::test]
    async fn close_breaks_pending_accept() {
        let l = TcpStreamListener::new("127.0.0.1:0".parse().unwrap());
        l.clone().listen().await.unwrap();
        let aio = Aio::waitable();
        l.clone().accept(&aio);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        l.close();
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::Closed));
    }

    #[tokio::test]
    async fn dial_refused_without_listener() {
        // Bind-then-drop to find a port that refuses connections.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let dialer = TcpDialer::new("127.0.0.1".into(), port, Family::Unspec);
        let aio = Aio::waitable();
        dialer.dial(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::ConnectionRefused));
    }
}

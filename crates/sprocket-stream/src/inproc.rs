//! In-process transport.
//!
//! Listeners register under a process-wide name; dialing creates a
//! `tokio::io::duplex` pair and hands one end to the listener's accept
//! queue. No serialization shortcut is taken: the bytes (handshake,
//! length prefixes, payloads) flow exactly as they would over a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sprocket_core::{Aio, Error, OptValue, Result};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::conn::Connection;
use crate::{StreamDialer, StreamListener};

/// Buffer size of each direction of a duplex pair. Deliberately small
/// enough that large messages exercise the partial-transfer path.
const DUPLEX_BUF: usize = 64 * 1024;

static REGISTRY: Lazy<Mutex<HashMap<String, mpsc::UnboundedSender<Arc<Connection>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn label(name: &str) -> String {
    format!("inproc://{name}")
}

// ── Listener ────────────────────────────────────────────────────────────

pub struct InprocListener {
    name: String,
    queue: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Arc<Connection>>>>,
    listening: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
}

impl InprocListener {
    pub fn new(name: String) -> Arc<InprocListener> {
        Arc::new(InprocListener {
            name,
            queue: tokio::sync::Mutex::new(None),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }
}

impl StreamListener for InprocListener {
    fn listen(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if self.listening.load(Ordering::SeqCst) {
                return Err(Error::InvalidState);
            }
            let mut queue = self.queue.try_lock().map_err(|_| Error::Busy)?;
            let mut reg = REGISTRY.lock();
            if reg.contains_key(&self.name) {
                return Err(Error::AddressInUse);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            reg.insert(self.name.clone(), tx);
            drop(reg);
            *queue = Some(rx);
            self.listening.store(true, Ordering::SeqCst);
            Ok(())
        })
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
            if !self.listening.load(Ordering::SeqCst) {
                aio.finish_sync(Err(Error::InvalidState), 0);
                return;
            }
            let notified = self.close_notify.notified();
            tokio::pin!(notified);
            if self.closed.load(Ordering::SeqCst) {
                aio.finish_sync(Err(Error::Closed), 0);
                return;
            }
            let mut queue = tokio::select! {
                biased;
                Ok(err) = &mut canceled => {
                    aio.finish_sync(Err(err), 0);
                    return;
                }
                _ = &mut notified => {
                    aio.finish_sync(Err(Error::Closed), 0);
                    return;
                }
                guard = self.queue.lock() => guard,
            };
            let Some(rx) = queue.as_mut() else {
                aio.finish_sync(Err(Error::InvalidState), 0);
                return;
            };
            let res = tokio::select! {
                biased;
                Ok(err) = &mut canceled => Err(err),
                _ = &mut notified => Err(Error::Closed),
                conn = rx.recv() => conn.ok_or(Error::Closed),
            };
            drop(queue);
            match res {
                Ok(conn) => {
                    aio.set_output(conn);
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
        if self.listening.load(Ordering::SeqCst) {
            REGISTRY.lock().remove(&self.name);
        }
        self.close_notify.notify_waiters();
    }

    fn bound_port(&self) -> Option<u16> {
        None
    }

    fn set_opt(&self, _name: &str, _value: &OptValue) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_opt(&self, _name: &str) -> Result<OptValue> {
        Err(Error::NotSupported)
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Dialer ──────────────────────────────────────────────────────────────

pub struct InprocDialer {
    name: String,
    closed: AtomicBool,
}

impl InprocDialer {
    pub fn new(name: String) -> Arc<InprocDialer> {
        Arc::new(InprocDialer {
            name,
            closed: AtomicBool::new(false),
        })
    }

    fn connect(&self) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let reg = REGISTRY.lock();
        let Some(tx) = reg.get(&self.name) else {
            return Err(Error::ConnectionRefused);
        };
        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUF);
        let name = label(&self.name);
        let theirs = Connection::from_stream(theirs, None, None, name.clone());
        tx.send(theirs).map_err(|_| Error::ConnectionRefused)?;
        Ok(Connection::from_stream(ours, None, None, name))
    }
}

impl StreamDialer for InprocDialer {
    fn dial(self: Arc<Self>, aio: &Arc<Aio>) {
        if aio.begin().is_err() {
            return;
        }
        if let Err(e) = aio.schedule(|_| {}) {
            aio.finish_sync(Err(e), 0);
            return;
        }
        // Rendezvous is immediate; no I/O to await.
        match self.connect() {
            Ok(conn) => {
                aio.set_output(conn);
                aio.finish_sync(Ok(()), 0);
            }
            Err(e) => aio.finish_sync(Err(e), 0),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn set_opt(&self, _name: &str, _value: &OptValue) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_opt(&self, _name: &str) -> Result<OptValue> {
        Err(Error::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rendezvous_produces_connected_pair() {
        let listener = InprocListener::new("pair-test".into());
        listener.clone().listen().await.unwrap();
        let accept_aio = Aio::waitable();
        listener.clone().accept(&accept_aio);

        let dialer = InprocDialer::new("pair-test".into());
        let dial_aio = Aio::waitable();
        dialer.dial(&dial_aio);
        dial_aio.wait().await;
        accept_aio.wait().await;

        let a: Arc<Connection> = dial_aio.take_output().unwrap();
        let b: Arc<Connection> = accept_aio.take_output().unwrap();

        let tx = Aio::waitable();
        tx.set_iov(vec![bytes::Bytes::from_static(b"ping")]);
        a.send(&tx);
        tx.wait().await;
        assert_eq!(tx.result(), Ok(()));

        let rx = Aio::waitable();
        rx.set_recv_buf(bytes::BytesMut::zeroed(4));
        b.recv(&rx);
        rx.wait().await;
        assert_eq!(rx.result(), Ok(()));
        assert_eq!(&rx.take_recv_buf().unwrap()[..], b"ping");
    }

    #[tokio::test]
    async fn second_listener_same_name_is_in_use() {
        let first = InprocListener::new("dup-name".into());
        first.clone().listen().await.unwrap();
        let second = InprocListener::new("dup-name".into());
        assert_eq!(second.clone().listen().await, Err(Error::AddressInUse));
    }

    #[tokio::test]
    async fn dial_without_listener_is_refused() {
        let dialer = InprocDialer::new("nobody-home".into());
        let aio = Aio::waitable();
        dialer.dial(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::ConnectionRefused));
    }

    #[tokio::test]
    async fn close_releases_the_name() {
        let first = InprocListener::new("release-me".into());
        first.clone().listen().await.unwrap();
        first.close();
        let second = InprocListener::new("release-me".into());
        second.clone().listen().await.unwrap();
    }
}

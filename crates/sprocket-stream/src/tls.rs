//! TLS-over-TCP stream dialer and listener.
//!
//! The engine does not load certificates or keys; callers hand over
//! pre-built rustls configs through [`TlsConfig`], set on the dialer or
//! listener before the first connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sprocket_core::{Aio, Error, OptValue, Result};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::conn::Connection;
use crate::resolve::Family;
use crate::tcp::{TcpDialer, TcpStreamListener};
use crate::{StreamDialer, StreamListener};

/// Pre-built TLS material. The client half drives dialers, the server
/// half drives listeners; `server_name` overrides the SNI name derived
/// from the URL host.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub client: Option<Arc<rustls::ClientConfig>>,
    pub server: Option<Arc<rustls::ServerConfig>>,
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Classify a TLS-layer failure.
///
/// Verification failures can surface either as a local rustls error or as
/// the peer dropping the stream mid-handshake, so callers observing a
/// failed verification may see any of `PeerAuth`, `Crypto`, or `Closed`.
pub(crate) fn classify_tls(e: &io::Error) -> Error {
    if let Some(inner) = e.get_ref() {
        if let Some(te) = inner.downcast_ref::<rustls::Error>() {
            return match te {
                rustls::Error::InvalidCertificate(_) => Error::PeerAuth,
                rustls::Error::AlertReceived(_) => Error::PeerAuth,
                rustls::Error::NoCertificatesPresented => Error::PeerAuth,
                _ => Error::Crypto,
            };
        }
    }
    Error::from_io(e)
}

pub(crate) fn tls_connection(
    stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
) -> Arc<Connection> {
    let label = peer
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Connection::from_stream(stream, local, peer, label)
}

// ── Dialer ──────────────────────────────────────────────────────────────

pub struct TlsDialer {
    tcp: Arc<TcpDialer>,
    host: String,
    cfg: Mutex<TlsConfig>,
}

impl TlsDialer {
    pub fn new(host: String, port: u16, family: Family) -> Arc<TlsDialer> {
        Arc::new(TlsDialer {
            tcp: TcpDialer::new(host.clone(), port, family),
            host,
            cfg: Mutex::new(TlsConfig::default()),
        })
    }

    async fn connect(&self) -> Result<Arc<Connection>> {
        let cfg = self.cfg.lock().clone();
        let Some(client) = cfg.client else {
            return Err(Error::Invalid);
        };
        let sni = cfg.server_name.unwrap_or_else(|| self.host.clone());
        let name = ServerName::try_from(sni).map_err(|_| Error::AddressInvalid)?;
        let tcp = self.tcp.connect().await?;
        let local = tcp.local_addr().ok();
        let peer = tcp.peer_addr().ok();
        let tls = TlsConnector::from(client)
            .connect(name, tcp)
            .await
            .map_err(|e| classify_tls(&e))?;
        Ok(tls_connection(tls, local, peer))
    }
}

impl StreamDialer for TlsDialer {
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
                Ok(conn) => {
                    aio.set_output(conn);
                    aio.finish_sync(Ok(()), 0);
                }
                Err(e) => aio.finish_sync(Err(e), 0),
            }
        });
    }

    fn close(&self) {
        StreamDialer::close(&*self.tcp);
    }

    fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        self.tcp.set_opt(name, value)
    }

    fn get_opt(&self, name: &str) -> Result<OptValue> {
        self.tcp.get_opt(name)
    }

    fn set_tls(&self, cfg: TlsConfig) -> Result<()> {
        *self.cfg.lock() = cfg;
        Ok(())
    }

    fn get_tls(&self) -> Result<TlsConfig> {
        Ok(self.cfg.lock().clone())
    }
}

// ── Listener ────────────────────────────────────────────────────────────

pub struct TlsListener {
    tcp: Arc<TcpStreamListener>,
    cfg: Mutex<TlsConfig>,
}

impl TlsListener {
    pub fn new(addr: SocketAddr) -> Arc<TlsListener> {
        Arc::new(TlsListener {
            tcp: TcpStreamListener::new(addr),
            cfg: Mutex::new(TlsConfig::default()),
        })
    }

    async fn accept_tls(
        self: Arc<Self>,
        canceled: &mut oneshot::Receiver<Error>,
    ) -> Result<Arc<Connection>> {
        let Some(server) = self.cfg.lock().server.clone() else {
            return Err(Error::Invalid);
        };
        let tcp = self.tcp.accept_stream(canceled).await?;
        let local = tcp.local_addr().ok();
        let peer = tcp.peer_addr().ok();
        let tls = TlsAcceptor::from(server)
            .accept(tcp)
            .await
            .map_err(|e| classify_tls(&e))?;
        Ok(tls_connection(tls, local, peer))
    }
}

impl StreamListener for TlsListener {
    fn listen(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        self.tcp.clone().listen()
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
            match self.accept_tls(&mut canceled).await {
                Ok(conn) => {
                    aio.set_output(conn);
                    aio.finish_sync(Ok(()), 0);
                }
                Err(e) => aio.finish_sync(Err(e), 0),
            }
        });
    }

    fn close(&self) {
        self.tcp.close();
    }

    fn bound_port(&self) -> Option<u16> {
        self.tcp.bound_port()
    }

    fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        self.tcp.set_opt(name, value)
    }

    fn get_opt(&self, name: &str) -> Result<OptValue> {
        self.tcp.get_opt(name)
    }

    fn set_tls(&self, cfg: TlsConfig) -> Result<()> {
        *self.cfg.lock() = cfg;
        Ok(())
    }

    fn get_tls(&self) -> Result<TlsConfig> {
        Ok(self.cfg.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_without_config_is_invalid() {
        let dialer = TlsDialer::new("localhost".into(), 1, Family::Unspec);
        let aio = Aio::waitable();
        dialer.dial(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::Invalid));
    }

    #[tokio::test]
    async fn accept_without_config_is_invalid() {
        let listener = TlsListener::new("127.0.0.1:0".parse().unwrap());
        listener.clone().listen().await.unwrap();
        let aio = Aio::waitable();
        listener.clone().accept(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::Invalid));
    }

    #[tokio::test]
    async fn config_round_trips() {
        let listener = TlsListener::new("127.0.0.1:0".parse().unwrap());
        let cfg = TlsConfig {
            server_name: Some("example.org".into()),
            ..TlsConfig::default()
        };
        listener.set_tls(cfg).unwrap();
        assert_eq!(
            listener.get_tls().unwrap().server_name.as_deref(),
            Some("example.org")
        );
    }
}

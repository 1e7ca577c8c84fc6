//! WebSocket stream dialer and listener.
//!
//! The engine frames its own wire format, so a WebSocket is exposed as a
//! plain byte stream: outbound writes become binary frames, inbound binary
//! frames are buffered and drained by reads. Text frames are a protocol
//! violation. `wss://` runs the same adapter over rustls.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use parking_lot::Mutex;
use sprocket_core::{Aio, Error, OptValue, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::{Connector, WebSocketStream, accept_async, connect_async_tls_with_config};

use crate::conn::Connection;
use crate::tcp::TcpStreamListener;
use crate::tls::{TlsConfig, classify_tls};
use crate::{StreamDialer, StreamListener};

fn ws_err(e: WsError) -> Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::Closed,
        WsError::Io(ref io) => Error::from_io(io),
        WsError::Tls(_) => Error::Crypto,
        WsError::Url(_) => Error::AddressInvalid,
        WsError::Capacity(_) => Error::MessageTooBig,
        _ => Error::Protocol,
    }
}

fn ws_io_err(e: WsError) -> io::Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, "websocket closed")
        }
        WsError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

// ── Byte-stream adapter ─────────────────────────────────────────────────

/// Adapts a `WebSocketStream` to `AsyncRead`/`AsyncWrite`.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    readbuf: BytesMut,
    eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> WsByteStream<S> {
        WsByteStream {
            inner,
            readbuf: BytesMut::new(),
            eof: false,
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = out.remaining().min(this.readbuf.len());
                out.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.readbuf.extend_from_slice(&data),
                Some(Ok(Message::Close(_))) | None => this.eof = true,
                // Pings are answered by tungstenite internally; pongs and
                // raw frames carry no payload bytes for us.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frame on byte stream",
                    )));
                }
                Some(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_io_err)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_io_err)?;
        // Opportunistic: the caller's flush drives completion.
        let _ = Pin::new(&mut this.inner).poll_flush(cx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_io_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_io_err)
    }
}

// ── Dialer ──────────────────────────────────────────────────────────────

pub struct WsDialer {
    url: String,
    secure: bool,
    tls: Mutex<TlsConfig>,
    closed: AtomicBool,
}

impl WsDialer {
    /// `url` is the full `ws://` or `wss://` URL including any path.
    pub fn new(url: String, secure: bool) -> Arc<WsDialer> {
        Arc::new(WsDialer {
            url,
            secure,
            tls: Mutex::new(TlsConfig::default()),
            closed: AtomicBool::new(false),
        })
    }

    async fn connect(&self) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let connector = if self.secure {
            let Some(client) = self.tls.lock().client.clone() else {
                return Err(Error::Invalid);
            };
            Some(Connector::Rustls(client))
        } else {
            None
        };
        let (ws, _resp) = connect_async_tls_with_config(self.url.as_str(), None, false, connector)
            .await
            .map_err(ws_err)?;
        Ok(Connection::from_stream(
            WsByteStream::new(ws),
            None,
            None,
            self.url.clone(),
        ))
    }
}

impl StreamDialer for WsDialer {
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
        self.closed.store(true, Ordering::SeqCst);
    }

    fn set_opt(&self, _name: &str, _value: &OptValue) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_opt(&self, _name: &str) -> Result<OptValue> {
        Err(Error::NotSupported)
    }

    fn set_tls(&self, cfg: TlsConfig) -> Result<()> {
        *self.tls.lock() = cfg;
        Ok(())
    }

    fn get_tls(&self) -> Result<TlsConfig> {
        Ok(self.tls.lock().clone())
    }
}

// ── Listener ────────────────────────────────────────────────────────────

pub struct WsListener {
    tcp: Arc<TcpStreamListener>,
    secure: bool,
    tls: Mutex<TlsConfig>,
}

impl WsListener {
    pub fn new(addr: SocketAddr, secure: bool) -> Arc<WsListener> {
        Arc::new(WsListener {
            tcp: TcpStreamListener::new(addr),
            secure,
            tls: Mutex::new(TlsConfig::default()),
        })
    }

    async fn accept_ws(
        self: Arc<Self>,
        canceled: &mut oneshot::Receiver<Error>,
    ) -> Result<Arc<Connection>> {
        let server = if self.secure {
            match self.tls.lock().server.clone() {
                Some(s) => Some(s),
                None => return Err(Error::Invalid),
            }
        } else {
            None
        };
        let tcp = self.tcp.accept_stream(canceled).await?;
        let local = tcp.local_addr().ok();
        let peer = tcp.peer_addr().ok();
        let label = peer
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if let Some(server) = server {
            let tls = tokio_rustls::TlsAcceptor::from(server)
                .accept(tcp)
                .await
                .map_err(|e| classify_tls(&e))?;
            let ws = accept_async(tls).await.map_err(ws_err)?;
            Ok(Connection::from_stream(
                WsByteStream::new(ws),
                local,
                peer,
                label,
            ))
        } else {
            let ws = accept_async(tcp).await.map_err(ws_err)?;
            Ok(Connection::from_stream(
                WsByteStream::new(ws),
                local,
                peer,
                label,
            ))
        }
    }
}

impl StreamListener for WsListener {
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
            match self.accept_ws(&mut canceled).await {
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
        *self.tls.lock() = cfg;
        Ok(())
    }

    fn get_tls(&self) -> Result<TlsConfig> {
        Ok(self.tls.lock().clone())
    }
}

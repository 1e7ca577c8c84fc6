//! sprocket — core transport engine for an SP-style messaging library.
//!
//! The engine multiplexes an application messaging protocol across byte
//! streams (in-process, TCP, TLS, WebSocket) through long-lived, framed
//! connections called **pipes**, each produced by a **dialer** or a
//! **listener**. Every message travels as an 8-byte big-endian length
//! prefix followed by the payload; before any frame, both sides exchange
//! the 8-byte `\0SP\0` handshake carrying their 16-bit protocol id.
//!
//! All asynchronous operations are driven by [`Aio`] descriptors: the
//! caller submits an AIO, may cancel it or give it a deadline, and
//! observes the completion through its callback or [`Aio::wait`].
//!
//! ```rust,no_run
//! use sprocket::{Aio, Message, Pipe};
//!
//! # async fn demo() -> sprocket::Result<()> {
//! let listener = sprocket::listen("tcp://127.0.0.1:7878", 0x0501).await?;
//! listener.bind().await?;
//!
//! let accepted = Aio::waitable();
//! listener.accept(&accepted);
//!
//! let dialer = sprocket::dial("tcp://127.0.0.1:7878", 0x0501)?;
//! let connected = Aio::waitable();
//! dialer.connect(&connected);
//!
//! connected.wait().await;
//! connected.result()?;
//! let pipe: Pipe = connected.take_output().expect("pipe output");
//!
//! let send = Aio::waitable();
//! send.set_msg(Message::from(&b"hello"[..]));
//! pipe.send(&send);
//! send.wait().await;
//! send.result()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

mod endpoint;
mod pipe;
pub mod transport;

use endpoint::Ep;

pub use pipe::Pipe;
pub use sprocket_core::{Aio, AioTimeout, Error, Message, OptValue, Result, Url, names};
pub use sprocket_stream::{Connection, StreamDialer, StreamListener, TlsConfig};
pub use transport::{Transport, register};

/// Create a dialer for `url`, speaking protocol `proto`.
///
/// Fails with [`Error::NotSupported`] for an unknown scheme and
/// [`Error::AddressInvalid`] for a URL the scheme rejects. No connection
/// is attempted until [`Dialer::connect`] or [`Dialer::start`].
pub fn dial(url: &str, proto: u16) -> Result<Dialer> {
    let url = Url::parse(url)?;
    let t = transport::find(url.scheme()).ok_or(Error::NotSupported)?;
    (t.check_url)(&url, true)?;
    let dialer = (t.dialer)(&url)?;
    Ok(Dialer {
        ep: Ep::new_dialer(url, proto, dialer),
    })
}

/// Create a listener for `url`, speaking protocol `proto`.
///
/// Name resolution happens here, once; binding is a separate
/// [`Listener::bind`] step.
pub async fn listen(url: &str, proto: u16) -> Result<Listener> {
    let url = Url::parse(url)?;
    let t = transport::find(url.scheme()).ok_or(Error::NotSupported)?;
    (t.check_url)(&url, false)?;
    let listener = (t.listener)(url.clone()).await?;
    Ok(Listener {
        ep: Ep::new_listener(url, proto, listener),
    })
}

/// A dialing endpoint: produces pipes by connecting out.
pub struct Dialer {
    pub(crate) ep: Arc<Ep>,
}

impl Dialer {
    pub fn id(&self) -> u64 {
        self.ep.id()
    }

    /// Submit a connect request. On success the AIO's output slot holds
    /// the matched [`Pipe`]. A second request while one is pending fails
    /// with [`Error::Busy`].
    pub fn connect(&self, aio: &Arc<Aio>) {
        self.ep.connect(aio);
    }

    /// Dial in the background, retrying with exponential backoff between
    /// the `reconnect-time-min` and `reconnect-time-max` options. An
    /// established pipe parks until [`Dialer::connect`] claims it.
    pub fn start(&self) -> Result<()> {
        self.ep.start_redial()
    }

    /// Close the endpoint and every pipe it produced. Idempotent.
    pub fn close(&self) {
        self.ep.close();
    }

    /// Close and schedule final teardown; completes (on the reap worker)
    /// once the last pipe has been reaped.
    pub fn fini(&self) {
        self.ep.fini();
    }

    pub fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        self.ep.set_opt(name, value)
    }

    pub fn get_opt(&self, name: &str) -> Result<OptValue> {
        self.ep.get_opt(name)
    }

    pub fn set_tls(&self, cfg: TlsConfig) -> Result<()> {
        self.ep.set_tls(cfg)
    }

    pub fn get_tls(&self) -> Result<TlsConfig> {
        self.ep.get_tls()
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("id", &self.id()).finish()
    }
}

/// A listening endpoint: produces pipes by accepting inbound streams.
pub struct Listener {
    pub(crate) ep: Arc<Ep>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.ep.id()
    }

    /// Bind the underlying stream listener. Fails with
    /// [`Error::AddressInUse`] when the address is taken and
    /// [`Error::InvalidState`] when already bound.
    pub async fn bind(&self) -> Result<()> {
        self.ep.bind().await
    }

    /// Submit an accept request; same single-slot semantics as
    /// [`Dialer::connect`]. Requires a successful [`Listener::bind`].
    pub fn accept(&self, aio: &Arc<Aio>) {
        self.ep.accept(aio);
    }

    /// Close the endpoint and every pipe it produced. Idempotent.
    pub fn close(&self) {
        self.ep.close();
    }

    /// Close and schedule final teardown; completes (on the reap worker)
    /// once the last pipe has been reaped.
    pub fn fini(&self) {
        self.ep.fini();
    }

    pub fn set_opt(&self, name: &str, value: &OptValue) -> Result<()> {
        self.ep.set_opt(name, value)
    }

    pub fn get_opt(&self, name: &str) -> Result<OptValue> {
        self.ep.get_opt(name)
    }

    pub fn set_tls(&self, cfg: TlsConfig) -> Result<()> {
        self.ep.set_tls(cfg)
    }

    pub fn get_tls(&self) -> Result<TlsConfig> {
        self.ep.get_tls()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("id", &self.id()).finish()
    }
}

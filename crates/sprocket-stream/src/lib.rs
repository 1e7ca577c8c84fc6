//! Byte-stream transports for the sprocket engine.
//!
//! Every transport reduces to the same shape: a [`StreamDialer`] or
//! [`StreamListener`] that produces [`Connection`]s, pairs of async
//! read/write halves with an AIO-driven send/recv surface. The pipe layer
//! above never sees anything transport-specific.
//!
//! Supported schemes: `inproc` (in-process duplex pairs), `tcp`/`tcp4`/
//! `tcp6`, `tls+tcp` (and the `4`/`6` variants), `ws` and `wss`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use sprocket_core::{Aio, Error, OptValue, Result};

mod conn;
pub mod inproc;
pub mod resolve;
pub mod tcp;
pub mod tls;
pub mod ws;

pub use conn::Connection;
pub use resolve::Family;
pub use tls::TlsConfig;

/// A factory for outbound connections of one scheme.
///
/// `dial` is asynchronous and AIO-driven: on success the AIO's output slot
/// holds the new [`Connection`] (`Arc<Connection>`).
pub trait StreamDialer: Send + Sync + 'static {
    fn dial(self: Arc<Self>, aio: &Arc<Aio>);

    /// Stop producing connections. Idempotent.
    fn close(&self);

    fn set_opt(&self, name: &str, value: &OptValue) -> Result<()>;

    fn get_opt(&self, name: &str) -> Result<OptValue>;

    fn set_tls(&self, _cfg: TlsConfig) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_tls(&self) -> Result<TlsConfig> {
        Err(Error::NotSupported)
    }
}

/// A factory for inbound connections of one scheme.
///
/// `listen` binds the local address (fails with `AddressInUse` when taken,
/// `InvalidState` when already bound); `accept` is AIO-driven like `dial`.
pub trait StreamListener: Send + Sync + 'static {
    fn listen(self: Arc<Self>) -> BoxFuture<'static, Result<()>>;

    fn accept(self: Arc<Self>, aio: &Arc<Aio>);

    /// Stop accepting and release the bound address. Idempotent.
    fn close(&self);

    /// The concrete port after a wildcard bind, if this transport has one.
    fn bound_port(&self) -> Option<u16>;

    fn set_opt(&self, name: &str, value: &OptValue) -> Result<()>;

    fn get_opt(&self, name: &str) -> Result<OptValue>;

    fn set_tls(&self, _cfg: TlsConfig) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_tls(&self) -> Result<TlsConfig> {
        Err(Error::NotSupported)
    }
}

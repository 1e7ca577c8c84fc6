//! Scheme registry: maps URL schemes to stream-factory constructors.
//!
//! The built-in transports are seeded from a compile-time table on first
//! use; [`register`] adds externally provided ones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use sprocket_core::{Aio, Error, Result, Url};
use sprocket_stream::inproc::{InprocDialer, InprocListener};
use sprocket_stream::resolve::resolve_aio;
use sprocket_stream::tcp::{TcpDialer, TcpStreamListener};
use sprocket_stream::tls::{TlsDialer, TlsListener};
use sprocket_stream::ws::{WsDialer, WsListener};
use sprocket_stream::{Family, StreamDialer, StreamListener};

/// One registered transport scheme.
pub struct Transport {
    pub scheme: String,
    /// Scheme-specific URL validation; `dial` distinguishes the dialing
    /// rules from the listening ones.
    pub check_url: fn(&Url, bool) -> Result<()>,
    pub dialer: fn(&Url) -> Result<Arc<dyn StreamDialer>>,
    /// Listener construction is asynchronous: name resolution happens
    /// here, once, before bind.
    pub listener: fn(Url) -> BoxFuture<'static, Result<Arc<dyn StreamListener>>>,
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<Transport>>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for t in builtins() {
        map.insert(t.scheme.clone(), Arc::new(t));
    }
    RwLock::new(map)
});

/// Make an external transport discoverable by its URL scheme.
pub fn register(transport: Transport) -> Result<()> {
    let mut map = REGISTRY.write();
    if map.contains_key(&transport.scheme) {
        return Err(Error::InvalidState);
    }
    map.insert(transport.scheme.clone(), Arc::new(transport));
    Ok(())
}

pub(crate) fn find(scheme: &str) -> Option<Arc<Transport>> {
    REGISTRY.read().get(scheme).cloned()
}

fn builtins() -> Vec<Transport> {
    let mut out = vec![Transport {
        scheme: "inproc".into(),
        check_url: check_inproc,
        dialer: inproc_dialer,
        listener: inproc_listener,
    }];
    for scheme in ["tcp", "tcp4", "tcp6", "tls+tcp", "tls+tcp4", "tls+tcp6"] {
        let tls = scheme.starts_with("tls");
        out.push(Transport {
            scheme: scheme.into(),
            check_url: check_tcp,
            dialer: if tls { tls_dialer } else { tcp_dialer },
            listener: if tls { tls_listener } else { tcp_listener },
        });
    }
    for scheme in ["ws", "wss"] {
        out.push(Transport {
            scheme: scheme.into(),
            check_url: check_ws,
            dialer: ws_dialer,
            listener: ws_listener,
        });
    }
    out
}

/// `tcp6`, `tls+tcp4`, ... carry the address family in the scheme tail.
fn family(scheme: &str) -> Family {
    if scheme.ends_with('4') {
        Family::V4
    } else if scheme.ends_with('6') {
        Family::V6
    } else {
        Family::Unspec
    }
}

// ── URL validation ──────────────────────────────────────────────────────

fn check_tcp(url: &Url, dial: bool) -> Result<()> {
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(Error::AddressInvalid);
    }
    if url.fragment().is_some() || url.userinfo().is_some() || url.query().is_some() {
        return Err(Error::AddressInvalid);
    }
    if dial {
        if url.host().is_empty() || url.port().unwrap_or(0) == 0 {
            return Err(Error::AddressInvalid);
        }
    } else if url.port().is_none() {
        return Err(Error::AddressInvalid);
    }
    Ok(())
}

fn check_ws(url: &Url, dial: bool) -> Result<()> {
    // WebSocket URLs legitimately carry a path (and query).
    if url.fragment().is_some() || url.userinfo().is_some() {
        return Err(Error::AddressInvalid);
    }
    if dial {
        if url.host().is_empty() || url.port().unwrap_or(0) == 0 {
            return Err(Error::AddressInvalid);
        }
    } else if url.port().is_none() {
        return Err(Error::AddressInvalid);
    }
    Ok(())
}

fn check_inproc(url: &Url, _dial: bool) -> Result<()> {
    if url.host().is_empty() || url.port().is_some() {
        return Err(Error::AddressInvalid);
    }
    if !url.path().is_empty() || url.fragment().is_some() || url.query().is_some() {
        return Err(Error::AddressInvalid);
    }
    Ok(())
}

// ── Factory constructors ────────────────────────────────────────────────

fn inproc_dialer(url: &Url) -> Result<Arc<dyn StreamDialer>> {
    Ok(InprocDialer::new(url.host().to_string()))
}

fn inproc_listener(url: Url) -> BoxFuture<'static, Result<Arc<dyn StreamListener>>> {
    Box::pin(async move {
        let listener: Arc<dyn StreamListener> = InprocListener::new(url.host().to_string());
        Ok(listener)
    })
}

fn tcp_dialer(url: &Url) -> Result<Arc<dyn StreamDialer>> {
    Ok(TcpDialer::new(
        url.host().to_string(),
        url.port().unwrap_or(0),
        family(url.scheme()),
    ))
}

fn tcp_listener(url: Url) -> BoxFuture<'static, Result<Arc<dyn StreamListener>>> {
    Box::pin(async move {
        let addr = resolve_for_listen(&url).await?;
        let listener: Arc<dyn StreamListener> = TcpStreamListener::new(addr);
        Ok(listener)
    })
}

fn tls_dialer(url: &Url) -> Result<Arc<dyn StreamDialer>> {
    Ok(TlsDialer::new(
        url.host().to_string(),
        url.port().unwrap_or(0),
        family(url.scheme()),
    ))
}

fn tls_listener(url: Url) -> BoxFuture<'static, Result<Arc<dyn StreamListener>>> {
    Box::pin(async move {
        let addr = resolve_for_listen(&url).await?;
        let listener: Arc<dyn StreamListener> = TlsListener::new(addr);
        Ok(listener)
    })
}

fn ws_dialer(url: &Url) -> Result<Arc<dyn StreamDialer>> {
    Ok(WsDialer::new(url.to_string(), url.scheme() == "wss"))
}

fn ws_listener(url: Url) -> BoxFuture<'static, Result<Arc<dyn StreamListener>>> {
    Box::pin(async move {
        let addr = resolve_for_listen(&url).await?;
        let listener: Arc<dyn StreamListener> = WsListener::new(addr, url.scheme() == "wss");
        Ok(listener)
    })
}

/// Listener-side resolution: submit a resolve AIO and wait for it. The
/// small startup cost buys simple, synchronous bind semantics.
async fn resolve_for_listen(url: &Url) -> Result<SocketAddr> {
    let aio = Aio::waitable();
    resolve_aio(
        url.host().to_string(),
        url.port().unwrap_or(0),
        family(url.scheme()),
        &aio,
    );
    aio.wait().await;
    aio.result()?;
    aio.take_output::<SocketAddr>().ok_or(Error::AddressInvalid)
}

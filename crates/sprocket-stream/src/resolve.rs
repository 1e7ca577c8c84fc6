//! Name resolution and timer operations, AIO-driven.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use sprocket_core::{Aio, Error, Result};
use tokio::sync::oneshot;

/// Address family preference, derived from the URL scheme
/// (`tcp` / `tcp4` / `tcp6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unspec,
    V4,
    V6,
}

impl Family {
    fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::Unspec => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve a host/port pair to one socket address.
///
/// An empty host or `"*"` means the wildcard address of the requested
/// family. Literal IPs skip the resolver.
pub async fn resolve(host: &str, port: u16, family: Family) -> Result<SocketAddr> {
    if host.is_empty() || host == "*" {
        let ip: IpAddr = match family {
            Family::V6 => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        return Ok(SocketAddr::new(ip, port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        let addr = SocketAddr::new(ip, port);
        if !family.admits(&addr) {
            return Err(Error::AddressInvalid);
        }
        return Ok(addr);
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| Error::AddressInvalid)?;
    addrs
        .into_iter()
        .find(|a| family.admits(a))
        .ok_or(Error::AddressInvalid)
}

/// AIO-driven resolve; the output slot receives the `SocketAddr`.
pub fn resolve_aio(host: String, port: u16, family: Family, aio: &Arc<Aio>) {
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
            r = resolve(&host, port, family) => r,
        };
        match res {
            Ok(addr) => {
                aio.set_output(addr);
                aio.finish_sync(Ok(()), 0);
            }
            Err(e) => aio.finish_sync(Err(e), 0),
        }
    });
}

/// AIO-driven sleep; completes successfully after `dur` unless aborted.
pub fn sleep_aio(dur: Duration, aio: &Arc<Aio>) {
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
            _ = tokio::time::sleep(dur) => Ok(()),
        };
        aio.finish_sync(res, 0);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_skips_lookup() {
        let a = resolve("127.0.0.1", 80, Family::Unspec).await.unwrap();
        assert_eq!(a, "127.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn family_mismatch_is_invalid() {
        let e = resolve("127.0.0.1", 80, Family::V6).await.unwrap_err();
        assert_eq!(e, Error::AddressInvalid);
    }

    #[tokio::test]
    async fn wildcard_host() {
        let a = resolve("", 7, Family::V4).await.unwrap();
        assert_eq!(a, "0.0.0.0:7".parse().unwrap());
        let a6 = resolve("*", 7, Family::V6).await.unwrap();
        assert!(a6.is_ipv6());
    }

    #[tokio::test]
    async fn resolve_aio_delivers_output() {
        let aio = Aio::waitable();
        resolve_aio("127.0.0.1".into(), 99, Family::Unspec, &aio);
        aio.wait().await;
        assert_eq!(aio.result(), Ok(()));
        let addr: SocketAddr = aio.take_output().unwrap();
        assert_eq!(addr.port(), 99);
    }

    #[tokio::test]
    async fn sleep_aio_can_be_aborted() {
        let aio = Aio::waitable();
        sleep_aio(Duration::from_secs(30), &aio);
        aio.abort(Error::Canceled);
        aio.wait().await;
        assert_eq!(aio.result(), Err(Error::Canceled));
    }
}

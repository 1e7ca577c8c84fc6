use std::fmt;

use crate::Error;

/// A parsed endpoint URL.
///
/// Covers exactly what the supported schemes need
/// (`scheme://[userinfo@]host[:port][/path][?query][#fragment]`); it is not
/// a general-purpose URL implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl Url {
    /// Parse a URL string. Fails with [`Error::AddressInvalid`] on anything
    /// that does not fit the grammar above.
    pub fn parse(s: &str) -> Result<Url, Error> {
        let (scheme, rest) = s.split_once("://").ok_or(Error::AddressInvalid)?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(Error::AddressInvalid);
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((r, f)) => (r, Some(f.to_string())),
            None => (rest, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q.to_string())),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (userinfo, hostport) = match authority.split_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, authority),
        };

        // Bracketed IPv6 literals keep their colons out of the port split.
        let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or(Error::AddressInvalid)?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| Error::AddressInvalid)?),
                None if after.is_empty() => None,
                None => return Err(Error::AddressInvalid),
            };
            (host.to_string(), port)
        } else {
            match hostport.rsplit_once(':') {
                Some((h, p)) => {
                    let port = p.parse::<u16>().map_err(|_| Error::AddressInvalid)?;
                    (h.to_string(), Some(port))
                }
                None => (hostport.to_string(), None),
            }
        };

        Ok(Url {
            scheme: scheme.to_string(),
            userinfo,
            host,
            port,
            path,
            query,
            fragment,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn userinfo(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// A copy of this URL with the port replaced. Used to report the
    /// concrete bound port after a wildcard listen.
    pub fn with_port(&self, port: u16) -> Url {
        let mut u = self.clone();
        u.port = Some(port);
        u
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(u) = &self.userinfo {
            write!(f, "{u}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(p) = self.port {
            write!(f, ":{p}")?;
        }
        f.write_str(&self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        if let Some(fr) = &self.fragment {
            write!(f, "#{fr}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp() {
        let u = Url::parse("tcp://127.0.0.1:4567").unwrap();
        assert_eq!(u.scheme(), "tcp");
        assert_eq!(u.host(), "127.0.0.1");
        assert_eq!(u.port(), Some(4567));
        assert_eq!(u.path(), "");
        assert_eq!(u.to_string(), "tcp://127.0.0.1:4567");
    }

    #[test]
    fn parse_ipv6_literal() {
        let u = Url::parse("tcp6://[::1]:9000").unwrap();
        assert_eq!(u.host(), "::1");
        assert_eq!(u.port(), Some(9000));
        assert_eq!(u.to_string(), "tcp6://[::1]:9000");
    }

    #[test]
    fn parse_inproc_name() {
        let u = Url::parse("inproc://some-name").unwrap();
        assert_eq!(u.scheme(), "inproc");
        assert_eq!(u.host(), "some-name");
        assert_eq!(u.port(), None);
    }

    #[test]
    fn parse_ws_with_path() {
        let u = Url::parse("ws://example.com:80/chat?x=1#frag").unwrap();
        assert_eq!(u.path(), "/chat");
        assert_eq!(u.query(), Some("x=1"));
        assert_eq!(u.fragment(), Some("frag"));
    }

    #[test]
    fn parse_userinfo() {
        let u = Url::parse("tls+tcp://user:pw@host:5").unwrap();
        assert_eq!(u.userinfo(), Some("user:pw"));
        assert_eq!(u.host(), "host");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Url::parse("no-scheme-here").is_err());
        assert!(Url::parse("tcp://host:notaport").is_err());
        assert!(Url::parse("://host").is_err());
        assert!(Url::parse("tcp://[::1").is_err());
    }

    #[test]
    fn with_port_round_trips() {
        let u = Url::parse("tcp://0.0.0.0:0").unwrap();
        assert_eq!(u.with_port(8080).to_string(), "tcp://0.0.0.0:8080");
    }
}

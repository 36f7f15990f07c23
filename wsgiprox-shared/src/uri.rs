use std::fmt::Display;
use std::str::FromStr;

use http::Uri;
use http::uri::InvalidUri;

/// A thin wrapper over `http::Uri` carrying the helpers the tunnel engine
/// and resolver need: host/port extraction, CONNECT-target parsing
/// (`host:port`), and wildcard-parent computation for certificate reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    inner: Uri,
}

impl Display for TargetUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl TargetUri {
    pub fn new(uri: Uri) -> Self {
        TargetUri { inner: uri }
    }

    /// Parses a CONNECT request-target of the form `host:port`.
    pub fn from_connect_target(target: &str) -> Result<Self, InvalidUri> {
        let authority_form = format!("http://{target}");
        Ok(TargetUri {
            inner: Uri::try_from(authority_form)?,
        })
    }

    pub fn host(&self) -> &str {
        self.inner.host().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        match self.inner.port_u16() {
            Some(port) => port,
            None => match self.inner.scheme_str() {
                Some("https") => 443,
                _ => 80,
            },
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.query()
    }

    pub fn path_and_query(&self) -> String {
        match self.query() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path(), q),
            _ => self.path().to_string(),
        }
    }

    pub fn inner(&self) -> &Uri {
        &self.inner
    }

    /// Computes the wildcard parent for a hostname: `a.b.tld` -> `*.b.tld`.
    /// Hosts with fewer than three labels (and IP literals) have no sensible
    /// wildcard parent and fall back to themselves.
    pub fn wildcard_parent(host: &str) -> String {
        if host.parse::<std::net::IpAddr>().is_ok() {
            return host.to_string();
        }
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 3 {
            host.to_string()
        } else {
            format!("*.{}", labels[1..].join("."))
        }
    }
}

impl FromStr for TargetUri {
    type Err = InvalidUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TargetUri {
            inner: Uri::try_from(s.as_bytes())?,
        })
    }
}

impl From<Uri> for TargetUri {
    fn from(value: Uri) -> Self {
        TargetUri::new(value)
    }
}

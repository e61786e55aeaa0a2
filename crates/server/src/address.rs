// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use hvsock_common::{EndpointAddress, Error};

const HVSOCK_PREFIX: &str = "hvsock:";

/// Where a server listens. Hyper-V endpoints sit next to the ordinary socket families and
/// are dispatched by variant, never by name lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
    HyperV(EndpointAddress),
}

impl ListenAddress {
    #[must_use]
    pub fn is_hyperv(&self) -> bool {
        matches!(self, Self::HyperV(_))
    }
}

impl From<EndpointAddress> for ListenAddress {
    fn from(endpoint: EndpointAddress) -> Self {
        Self::HyperV(endpoint)
    }
}

impl From<SocketAddr> for ListenAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

/// `hvsock:<vm>.<service>`, a filesystem path starting with `/` or `.`, or `ip:port`.
impl FromStr for ListenAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(endpoint) = s.strip_prefix(HVSOCK_PREFIX) {
            return Ok(Self::HyperV(endpoint.parse()?));
        }
        #[cfg(unix)]
        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        s.parse()
            .map(Self::Tcp)
            .map_err(|e| Error::InvalidAddress(format!("{s}: {e}")))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::HyperV(endpoint) => write!(f, "{HVSOCK_PREFIX}{endpoint}"),
        }
    }
}

/// Remote side of an accepted connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerAddress {
    Tcp(SocketAddr),
    // Unnamed for most clients
    #[cfg(unix)]
    Unix(Option<PathBuf>),
    HyperV(Option<EndpointAddress>),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(Some(path)) => write!(f, "{}", path.display()),
            #[cfg(unix)]
            Self::Unix(None) => f.write_str("(unnamed)"),
            Self::HyperV(Some(endpoint)) => write!(f, "{HVSOCK_PREFIX}{endpoint}"),
            Self::HyperV(None) => write!(f, "{HVSOCK_PREFIX}(unknown)"),
        }
    }
}

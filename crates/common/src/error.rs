// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;

use thiserror::Error;

use crate::address::EndpointAddress;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid Hyper-V socket address: {0}")]
    InvalidAddress(String),

    #[error("connection to {endpoint} refused")]
    ConnectionRefused {
        endpoint: EndpointAddress,
        #[source]
        source: io::Error,
    },

    #[error("{endpoint} is unreachable")]
    Unreachable {
        endpoint: EndpointAddress,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("listener closed")]
    ListenerClosed,

    #[error("no listener factory can bind {0}")]
    NoListenerForAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Sort an OS connect failure into refused / unreachable / plain I/O.
    #[must_use]
    pub fn from_connect(endpoint: EndpointAddress, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { endpoint, source },
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::TimedOut => Self::Unreachable { endpoint, source },
            _ => Self::Io(source),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// HTTP stacks above us only speak `io::Error`; keep the kind so they can still branch on it.
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Io(inner) => return inner,
            Error::InvalidAddress(_) => io::ErrorKind::InvalidInput,
            Error::ConnectionRefused { .. } => io::ErrorKind::ConnectionRefused,
            Error::Unreachable { ref source, .. } => source.kind(),
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::ListenerClosed => io::ErrorKind::ConnectionAborted,
            Error::NoListenerForAddress(_) => io::ErrorKind::AddrNotAvailable,
        };
        io::Error::new(kind, err)
    }
}

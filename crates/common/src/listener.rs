// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};

use socket2::{SockAddr, Socket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::EndpointAddress;
use crate::error::Error;
use crate::stream::HvSocketStream;
use crate::sys::AsyncSocket;

/// Listening Hyper-V socket.
///
/// `accept` may be called concurrently; connections are handed out in the order the
/// kernel queued them. After [`close`](Self::close) every pending and future `accept`
/// fails with `ListenerClosed`.
#[derive(Debug)]
pub struct HvSocketListener {
    socket: Mutex<Option<Arc<AsyncSocket>>>,
    local: SockAddr,
    closed: CancellationToken,
}

impl HvSocketListener {
    /// Start listening on an already bound socket.
    ///
    /// # Errors
    /// `listen` failure or reactor registration failure.
    pub fn from_bound_socket(socket: Socket, backlog: i32) -> Result<Self, Error> {
        socket.listen(backlog)?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Mutex::new(Some(Arc::new(AsyncSocket::new(socket)?))),
            local,
            closed: CancellationToken::new(),
        })
    }

    /// # Errors
    /// `InvalidAddress` if the socket is not a Hyper-V socket.
    pub fn local_addr(&self) -> Result<EndpointAddress, Error> {
        EndpointAddress::from_sock_addr(&self.local)
    }

    /// # Errors
    /// * `ListenerClosed` once the listener is closed, including while waiting
    /// * `Cancelled` if `cancel` fires first; the listener stays usable
    /// * `Io` if `accept` itself fails
    pub async fn accept(&self, cancel: &CancellationToken) -> Result<HvSocketStream, Error> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::ListenerClosed)?;

        let (accepted, peer) = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(Error::ListenerClosed),
            () = cancel.cancelled() => return Err(Error::Cancelled),
            accepted = socket.accept() => accepted?,
        };
        match EndpointAddress::from_sock_addr(&peer) {
            Ok(peer) => debug!("Accepted Hyper-V connection from {peer}"),
            Err(_) => debug!("Accepted connection from non Hyper-V peer"),
        }
        Ok(HvSocketStream::from_socket(accepted)?)
    }

    /// Idempotent. The handle is released once in-flight `accept` calls have returned.
    pub fn close(&self) {
        self.closed.cancel();
        if let Some(socket) = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            drop(socket);
            debug!("Hyper-V listener closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for HvSocketListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Outbound connect.
//!
//! On unix the socket is connected non-blocking and driven by the reactor; giving up
//! drops the socket, which closes it. `AF_HYPERV` on Windows rejects overlapped
//! `ConnectEx`, so there the connect runs as a plain blocking call on tokio's blocking
//! pool. The worker only borrows the handle: cancellation takes the socket away from it
//! and closes it, which fails the pending `connect`, then waits a short grace period for
//! the worker to return.

#[cfg(windows)]
use std::io;
#[cfg(windows)]
use std::sync::{Arc, Mutex, PoisonError};
#[cfg(windows)]
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tokio_util::sync::CancellationToken;
use tracing::debug;
#[cfg(windows)]
use tracing::warn;

use crate::address::EndpointAddress;
use crate::error::Error;
use crate::socket::new_socket;
use crate::stream::HvSocketStream;
#[cfg(unix)]
use crate::sys::AsyncSocket;

#[cfg(windows)]
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Open and connect a Hyper-V socket to `endpoint`.
///
/// # Errors
/// * `Cancelled` if `cancel` fires before the connection is established
/// * `ConnectionRefused` / `Unreachable` for the corresponding OS failures
/// * `Io` for anything else, including platforms without Hyper-V sockets
pub async fn connect(
    endpoint: &EndpointAddress,
    cancel: &CancellationToken,
) -> Result<HvSocketStream, Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    debug!("Connecting to Hyper-V socket {endpoint}");
    let socket = new_socket()?;
    connect_socket(socket, endpoint.to_sock_addr(), cancel)
        .await
        .map_err(|err| match err {
            Error::Io(source) => Error::from_connect(*endpoint, source),
            other => other,
        })
}

/// Family-agnostic part of [`connect`]: takes ownership of a blocking `socket` and
/// closes it on every failure path, cancellation included.
pub(crate) async fn connect_socket(
    socket: Socket,
    addr: SockAddr,
    cancel: &CancellationToken,
) -> Result<HvSocketStream, Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    establish(socket, addr, cancel).await
}

#[cfg(unix)]
async fn establish(
    socket: Socket,
    addr: SockAddr,
    cancel: &CancellationToken,
) -> Result<HvSocketStream, Error> {
    let io = AsyncSocket::new(socket)?;
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("connect cancelled, closing socket");
            return Err(Error::Cancelled);
        }
        connected = io.connect(&addr) => connected?,
    }
    Ok(HvSocketStream::from_async(io))
}

/// Socket shared between the canceller and the blocking worker. Whoever takes it out
/// owns it; dropping it is `closesocket`.
#[cfg(windows)]
type SocketSlot = Arc<Mutex<Option<Socket>>>;

#[cfg(windows)]
fn take_socket(slot: &SocketSlot) -> Option<Socket> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Closes the socket unless disarmed, so a worker blocked in `connect` returns even
/// when the awaiting future is dropped rather than cancelled.
#[cfg(windows)]
struct CloseOnDrop(Option<SocketSlot>);

#[cfg(windows)]
impl CloseOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

#[cfg(windows)]
impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(socket) = self.0.take().as_ref().and_then(take_socket) {
            drop(socket);
            debug!("closed socket of aborted connect");
        }
    }
}

#[cfg(windows)]
async fn establish(
    socket: Socket,
    addr: SockAddr,
    cancel: &CancellationToken,
) -> Result<HvSocketStream, Error> {
    use std::os::windows::io::{AsRawSocket, BorrowedSocket};

    use socket2::SockRef;

    let raw = socket.as_raw_socket();
    let slot: SocketSlot = Arc::new(Mutex::new(Some(socket)));
    let mut close = CloseOnDrop(Some(Arc::clone(&slot)));
    let mut worker = tokio::task::spawn_blocking(move || {
        // SAFETY: the handle stays open until the canceller takes it out of the slot;
        // closing it under the worker fails the pending `connect`.
        let borrowed = unsafe { BorrowedSocket::borrow_raw(raw) };
        SockRef::from(&borrowed).connect(&addr)
    });

    let joined = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        joined = &mut worker => Some(joined),
    };

    let Some(joined) = joined else {
        drop(close);
        if tokio::time::timeout(CANCEL_GRACE, worker).await.is_err() {
            warn!("connect worker still blocked {CANCEL_GRACE:?} after its socket was closed");
        }
        return Err(Error::Cancelled);
    };

    close.disarm();
    joined.map_err(io::Error::other)??;
    let socket =
        take_socket(&slot).ok_or_else(|| io::Error::other("connected socket already closed"))?;
    Ok(HvSocketStream::from_socket(socket)?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use socket2::{Domain, Type};
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unix_listener(path: &std::path::Path) -> anyhow::Result<(Socket, SockAddr)> {
        let addr = SockAddr::unix(path)?;
        let listener = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        listener.bind(&addr)?;
        listener.listen(8)?;
        Ok((listener, addr))
    }

    #[tokio::test]
    async fn test_connect_socket_establishes_stream() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (listener, addr) = unix_listener(&dir.path().join("svc.sock"))?;

        let client = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let mut stream = connect_socket(client, addr, &CancellationToken::new()).await?;

        let (peer, _) = listener.accept()?;
        let mut peer = HvSocketStream::from_socket(peer)?;
        stream.write_all(b"hello").await?;
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_socket_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bound-not-listening.sock");
        let addr = SockAddr::unix(&path)?;
        let bound = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        bound.bind(&addr)?;

        let client = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let err = connect_socket(client, addr, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Io(source) => assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    // The listener never accepts, so once its backlog is full every further connect
    // stays pending.
    #[cfg(target_os = "linux")]
    fn saturated_listener(
        path: &std::path::Path,
    ) -> anyhow::Result<(Socket, SockAddr, Vec<Socket>)> {
        let addr = SockAddr::unix(path)?;
        let listener = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        listener.bind(&addr)?;
        listener.listen(0)?;
        let mut queued = Vec::new();
        for _ in 0..64 {
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            match socket.connect(&addr) {
                Ok(()) => queued.push(socket),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok((listener, addr, queued))
    }

    #[cfg(target_os = "linux")]
    fn fd_target(fd: std::os::fd::RawFd) -> Option<std::path::PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_pending_connect() -> anyhow::Result<()> {
        use std::os::fd::AsRawFd;
        use std::time::Instant;

        let dir = tempfile::tempdir()?;
        let (_listener, addr, _queued) = saturated_listener(&dir.path().join("full.sock"))?;

        let client = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let fd = client.as_raw_fd();
        let before = fd_target(fd);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let attempt = connect_socket(client, addr, &cancel);
        let err = tokio::time::timeout(Duration::from_secs(5), attempt)
            .await?
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(err.is_cancelled(), "{err:?}");
        assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");

        // The descriptor is gone, or the number was reused for another file.
        assert!(before.is_some());
        let after = fd_target(fd);
        assert!(after.is_none() || after != before, "fd {fd} still open");
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_pending_connect_completes_once_backlog_drains() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (listener, addr, queued) = saturated_listener(&dir.path().join("drain.sock"))?;

        let client = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let attempt = tokio::spawn(async move {
            connect_socket(client, addr, &CancellationToken::new()).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in &queued {
            drop(listener.accept()?);
        }

        let stream = tokio::time::timeout(Duration::from_secs(5), attempt).await???;
        drop(stream);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_socket_already_cancelled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (_listener, addr) = unix_listener(&dir.path().join("svc.sock"))?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let err = connect_socket(client, addr, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_cancelled_before_socket_creation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let endpoint = EndpointAddress::parent(uuid::Uuid::from_u128(0xc724_0163));
        // Holds on hosts without Hyper-V sockets too: no socket is ever created.
        let err = connect(&endpoint, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}

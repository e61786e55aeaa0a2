// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use socket2::{SockAddr, SockRef, Socket};
use tokio::io::ReadBuf;
use tokio::io::unix::AsyncFd;

// AF_UNIX reports a full backlog as EAGAIN and forgets the attempt instead of queueing it
const CONNECT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub(crate) struct AsyncSocket {
    inner: AsyncFd<Socket>,
}

impl AsyncSocket {
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub(crate) fn sock_ref(&self) -> SockRef<'_> {
        SockRef::from(self.inner.get_ref())
    }

    /// Non-blocking connect. Dropping the future abandons the attempt; the handle is
    /// closed together with `self`.
    pub(crate) async fn connect(&self, addr: &SockAddr) -> io::Result<()> {
        loop {
            match self.inner.get_ref().connect(addr) {
                Ok(()) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => break,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(err) => return Err(err),
            }
        }
        loop {
            let mut guard = self.inner.writable().await?;
            if let Some(err) = self.inner.get_ref().take_error()? {
                return Err(err);
            }
            match self.inner.get_ref().peer_addr() {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotConnected => guard.clear_ready(),
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<(Socket, SockAddr)> {
        loop {
            let mut guard = self.inner.readable().await?;
            if let Ok(accepted) = guard.try_io(|inner| inner.get_ref().accept()) {
                return accepted;
            }
        }
    }

    pub(crate) fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => {}
            }
        }
    }

    pub(crate) fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => {}
            }
        }
    }

    pub(crate) fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    pub(crate) fn poll_shutdown(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}

// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Registration of raw `socket2` sockets with the tokio reactor.
//!
//! Everything here is family agnostic: the same code drives `AF_HYPERV` sockets in
//! production and `AF_UNIX` sockets in tests.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::AsyncSocket;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::AsyncSocket;

// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable "bind and accept" capability of the server.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use hvsock_common::{CancellationToken, Error};

use crate::address::ListenAddress;
use crate::connection::Connection;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bound, listening socket of any family.
///
/// Lifecycle: listening from construction until `close`, which is idempotent.
pub trait ConnectionListener: fmt::Debug + Send + Sync {
    fn local_addr(&self) -> &ListenAddress;

    /// Next connection in arrival order.
    ///
    /// Fails with `ListenerClosed` once closed (also when closed while waiting) and with
    /// `Cancelled` when `cancel` fires first.
    fn accept<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Connection, Error>>;

    fn close(&self);
}

/// Creates listeners for the addresses it claims.
pub trait ListenerFactory: fmt::Debug + Send + Sync {
    fn can_bind(&self, addr: &ListenAddress) -> bool;

    fn bind<'a>(
        &'a self,
        addr: &'a ListenAddress,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn ConnectionListener>, Error>>;
}

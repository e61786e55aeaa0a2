// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Hyper-V socket listener factory and its registration on [`ServerOptions`].

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use hvsock_common::socket::create_bound_socket;
use hvsock_common::{CancellationToken, EndpointAddress, Error};

use crate::address::ListenAddress;
use crate::listener::{BoxFuture, ConnectionListener, ListenerFactory};
use crate::server::ServerOptions;
use crate::socket::{SocketListenerFactory, SocketTransportOptions};

pub const HVSOCK_LISTENER_FACTORY: &str = "hvsock";

/// Wrap the socket creation hook so Hyper-V endpoints get a raw `AF_HYPERV` socket and
/// every other address goes to the previous hook unchanged.
pub fn install_hvsock_socket_creation(options: &mut SocketTransportOptions) {
    let previous = Arc::clone(&options.create_bound_listen_socket);
    options.create_bound_listen_socket = Arc::new(move |addr: &ListenAddress| match addr {
        ListenAddress::HyperV(endpoint) => {
            debug!("Creating Hyper-V listen socket for {endpoint}");
            create_bound_socket(endpoint)
        }
        other => previous(other),
    });
}

/// Claims Hyper-V endpoints and hands every other bind to the wrapped default factory.
#[derive(Debug, Clone)]
pub struct HvSocketListenerFactory {
    inner: SocketListenerFactory,
}

impl HvSocketListenerFactory {
    #[must_use]
    pub fn new(mut options: SocketTransportOptions) -> Self {
        install_hvsock_socket_creation(&mut options);
        Self::wrap(SocketListenerFactory::new(options))
    }

    /// `inner` must already carry the Hyper-V socket creation override.
    #[must_use]
    pub fn wrap(inner: SocketListenerFactory) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn inner(&self) -> &SocketListenerFactory {
        &self.inner
    }
}

impl Default for HvSocketListenerFactory {
    fn default() -> Self {
        Self::new(SocketTransportOptions::default())
    }
}

impl ListenerFactory for HvSocketListenerFactory {
    fn can_bind(&self, addr: &ListenAddress) -> bool {
        addr.is_hyperv()
    }

    fn bind<'a>(
        &'a self,
        addr: &'a ListenAddress,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn ConnectionListener>, Error>> {
        if !self.can_bind(addr) {
            return self.inner.bind(addr, cancel);
        }
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let listener: Box<dyn ConnectionListener> = Box::new(self.inner.listen(addr)?);
            Ok(listener)
        })
    }
}

/// Registration of Hyper-V listeners on a server configuration.
pub trait HvSocketServerExt {
    /// Listen on `(vm_id, service_id)`. The factory and the socket creation override are
    /// registered on first use only.
    fn add_hvsock_listener(&mut self, vm_id: Uuid, service_id: Uuid) -> &mut Self;

    /// Listen on `service_id` for connections from any partition.
    fn add_hvsock_service_listener(&mut self, service_id: Uuid) -> &mut Self {
        self.add_hvsock_listener(hvsock_common::address::HV_GUID_WILDCARD, service_id)
    }
}

impl HvSocketServerExt for ServerOptions {
    fn add_hvsock_listener(&mut self, vm_id: Uuid, service_id: Uuid) -> &mut Self {
        let added = self.add_listener_factory_once(
            HVSOCK_LISTENER_FACTORY,
            |options: &SocketTransportOptions| -> Arc<dyn ListenerFactory> {
                let inner = SocketListenerFactory::new(options.clone());
                Arc::new(HvSocketListenerFactory::wrap(inner))
            },
        );
        if added {
            self.configure_socket_transport(install_hvsock_socket_creation);
        }
        self.listen(EndpointAddress::new(vm_id, service_id))
    }
}

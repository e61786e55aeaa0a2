// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::Context;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use hvsock_common::EndpointAddress;

use crate::connector::{ConnectorOptions, HvSocketConnector};

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub address: EndpointAddress,
    pub connect_timeout: Option<Duration>,
    pub concurrency_limit: usize,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            connect_timeout: Some(Duration::from_secs(2)),
            concurrency_limit: 30,
        }
    }

    // The URL only satisfies tonic's builder; the connector never looks at it.
    fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// gRPC channel over a Hyper-V socket.
    ///
    /// # Errors
    /// Fails if the first connection can't be established.
    pub async fn connect(&self) -> anyhow::Result<Channel> {
        let url = self.url();
        info!("Connecting to {url}");
        let endpoint = Endpoint::try_from(url.clone())?.concurrency_limit(self.concurrency_limit);
        let connector = HvSocketConnector::with_options(
            self.address,
            ConnectorOptions {
                connect_timeout: self.connect_timeout,
            },
        );
        let channel = endpoint
            .connect_with_connector(connector)
            .await
            .with_context(|| format!("Connecting Hyper-V socket {url}"))?;
        Ok(channel)
    }

    /// Like [`connect`](Self::connect), but the first connection is only made on first use.
    ///
    /// # Errors
    /// Fails if the placeholder URL is rejected.
    pub fn connect_lazy(&self) -> anyhow::Result<Channel> {
        let endpoint = Endpoint::try_from(self.url())?.concurrency_limit(self.concurrency_limit);
        let connector = HvSocketConnector::with_options(
            self.address,
            ConnectorOptions {
                connect_timeout: self.connect_timeout,
            },
        );
        Ok(endpoint.connect_with_connector_lazy(connector))
    }
}

// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;
use uuid::Uuid;

use hvsock_common::EndpointAddress;

use crate::connector::{ConnectorOptions, HvSocketConnector};

/// HTTP client pinned to one Hyper-V service.
///
/// Requests take a path (`/weatherforecast`); the authority of the base URI is the
/// endpoint's display form and is never resolved.
#[derive(Debug, Clone)]
pub struct HvHttpClient {
    connector: HvSocketConnector,
    client: Client<HvSocketConnector, Full<Bytes>>,
    base: String,
}

impl HvHttpClient {
    #[must_use]
    pub fn new(vm_id: Uuid, service_id: Uuid) -> Self {
        Self::with_options(
            EndpointAddress::new(vm_id, service_id),
            ConnectorOptions::default(),
        )
    }

    /// Guest to host shorthand: `service_id` on the parent partition.
    #[must_use]
    pub fn for_service(service_id: Uuid) -> Self {
        Self::with_options(
            EndpointAddress::parent(service_id),
            ConnectorOptions::default(),
        )
    }

    #[must_use]
    pub fn with_options(endpoint: EndpointAddress, options: ConnectorOptions) -> Self {
        let connector = HvSocketConnector::with_options(endpoint, options);
        let client = Client::builder(TokioExecutor::new()).build(connector.clone());
        Self {
            connector,
            client,
            base: format!("http://{endpoint}"),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &EndpointAddress {
        self.connector.endpoint()
    }

    /// `http://{vm_id}.{service_id}/`
    #[must_use]
    pub fn base_address(&self) -> String {
        format!("{}/", self.base)
    }

    /// # Errors
    /// Fails if `path` doesn't form a valid URI together with the base address.
    pub fn uri(&self, path: &str) -> anyhow::Result<Uri> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let uri = format!("{}/{path}", self.base);
        uri.parse()
            .with_context(|| format!("While building request URI {uri}"))
    }

    /// Abort connects in progress; later requests fail with `Cancelled`.
    pub fn cancel(&self) {
        self.connector.cancel();
    }

    /// # Errors
    /// Transport or protocol failure.
    pub async fn request(
        &self,
        request: Request<Full<Bytes>>,
    ) -> anyhow::Result<Response<Incoming>> {
        debug!("{} {}", request.method(), request.uri());
        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("While talking to {}", self.endpoint()))?;
        Ok(response)
    }

    /// # Errors
    /// Transport or protocol failure.
    pub async fn get(&self, path: &str) -> anyhow::Result<Response<Incoming>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.uri(path)?)
            .body(Full::default())?;
        self.request(request).await
    }

    /// # Errors
    /// Transport or protocol failure.
    pub async fn post(
        &self,
        path: &str,
        body: impl Into<Bytes>,
    ) -> anyhow::Result<Response<Incoming>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri(path)?)
            .body(Full::new(body.into()))?;
        self.request(request).await
    }

    /// GET `path` and return the body as text.
    ///
    /// # Errors
    /// Transport failure, non-success status, or a body that isn't UTF-8.
    pub async fn get_string(&self, path: &str) -> anyhow::Result<String> {
        let response = self.get(path).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            bail!("GET {path} returned {status}");
        }
        Ok(String::from_utf8(body.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvsock_common::address::HV_GUID_PARENT;
    use uuid::uuid;

    const SERVICE: Uuid = uuid!("c7240163-6e2b-4466-9e41-ff74e7f0de47");

    #[tokio::test]
    async fn test_for_service_targets_parent() -> anyhow::Result<()> {
        let client = HvHttpClient::for_service(SERVICE);
        assert_eq!(client.endpoint().vm_id(), HV_GUID_PARENT);
        assert_eq!(
            client.base_address(),
            "http://a42e7cdad03f480c9cc2a4de20abb878.c72401636e2b44669e41ff74e7f0de47/"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_uri_joins_path() -> anyhow::Result<()> {
        let client = HvHttpClient::new(Uuid::nil(), SERVICE);
        let uri = client.uri("/weatherforecast?days=3")?;
        assert_eq!(
            uri.host(),
            Some("00000000000000000000000000000000.c72401636e2b44669e41ff74e7f0de47")
        );
        assert_eq!(uri.path(), "/weatherforecast");
        assert_eq!(uri.query(), Some("days=3"));
        assert_eq!(client.uri("plain")?.path(), "/plain");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_client_fails_requests() {
        let client = HvHttpClient::for_service(SERVICE);
        client.cancel();
        let err = client.get("/").await.unwrap_err();
        let cancelled = err.chain().any(|cause| {
            cause
                .downcast_ref::<hvsock_common::Error>()
                .is_some_and(hvsock_common::Error::is_cancelled)
        });
        assert!(cancelled, "{err:?}");
    }
}

// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tonic::transport::Uri;
use tower::Service;
use tracing::debug;

use hvsock_common::{CancellationToken, EndpointAddress, Error, HvSocketStream};

#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// Upper bound for one connect attempt. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
}

/// "Open a connection" hook for HTTP clients: every call dials the same Hyper-V endpoint.
///
/// The request URI is ignored; its authority is only a placeholder. Cancelling the
/// connector's token aborts in-flight and future connects with `Cancelled`.
#[derive(Debug, Clone)]
pub struct HvSocketConnector {
    endpoint: EndpointAddress,
    options: ConnectorOptions,
    cancel: CancellationToken,
}

impl HvSocketConnector {
    #[must_use]
    pub fn new(endpoint: EndpointAddress) -> Self {
        Self::with_options(endpoint, ConnectorOptions::default())
    }

    #[must_use]
    pub fn with_options(endpoint: EndpointAddress, options: ConnectorOptions) -> Self {
        Self {
            endpoint,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Share cancellation with an outer token: connects stop when `parent` is cancelled.
    #[must_use]
    pub fn with_cancellation(self, parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            ..self
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    /// Abort every in-flight connect of this connector and its clones.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// # Errors
    /// Same as [`hvsock_common::connect`]; a timeout is reported as `Unreachable`.
    pub async fn connect(&self) -> Result<HvSocketStream, Error> {
        let stream = self
            .bounded(|cancel| async move {
                hvsock_common::connect(&self.endpoint, &cancel).await
            })
            .await?;
        debug!("Connected to {}", self.endpoint);
        Ok(stream)
    }

    /// Run one attempt under a child token. On timeout the token is cancelled and the
    /// attempt is awaited, so its socket is closed before the error is returned.
    async fn bounded<F, Fut>(&self, attempt: F) -> Result<HvSocketStream, Error>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<HvSocketStream, Error>>,
    {
        let cancel = self.cancel.child_token();
        let attempt = attempt(cancel.clone());
        let Some(limit) = self.options.connect_timeout else {
            return attempt.await;
        };
        tokio::pin!(attempt);
        tokio::select! {
            result = &mut attempt => result,
            () = tokio::time::sleep(limit) => {
                cancel.cancel();
                let _ = attempt.await;
                Err(Error::Unreachable {
                    endpoint: self.endpoint,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection after {limit:?}"),
                    ),
                })
            }
        }
    }
}

impl Service<Uri> for HvSocketConnector {
    type Response = TokioIo<HvSocketStream>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move { connector.connect().await.map(TokioIo::new) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvsock_common::address::HV_GUID_PARENT;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    fn connector() -> HvSocketConnector {
        HvSocketConnector::new(EndpointAddress::new(HV_GUID_PARENT, Uuid::from_u128(7)))
    }

    #[tokio::test]
    async fn test_cancelled_connector_never_connects() {
        let mut connector = connector();
        connector.cancel();
        let err = connector
            .call(Uri::from_static("http://ignored/"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_token_cancels_clones() {
        let parent = CancellationToken::new();
        let connector = connector().with_cancellation(&parent);
        let clone = connector.clone();
        parent.cancel();
        assert!(clone.connect().await.unwrap_err().is_cancelled());
        assert!(connector.connect().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_timeout_cancels_attempt_and_waits_for_it() {
        let connector = HvSocketConnector::with_options(
            EndpointAddress::new(HV_GUID_PARENT, Uuid::from_u128(7)),
            ConnectorOptions {
                connect_timeout: Some(Duration::from_millis(20)),
            },
        );
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let err = connector
            .bounded(|cancel| async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                flag.store(true, Ordering::SeqCst);
                Err(Error::Cancelled)
            })
            .await
            .unwrap_err();

        assert!(released.load(Ordering::SeqCst));
        match err {
            Error::Unreachable { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        // Only the attempt's own token is cancelled.
        assert!(!connector.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_attempt_within_limit_keeps_its_result() {
        let connector = HvSocketConnector::with_options(
            EndpointAddress::new(HV_GUID_PARENT, Uuid::from_u128(7)),
            ConnectorOptions {
                connect_timeout: Some(Duration::from_secs(5)),
            },
        );
        let err = connector
            .bounded(|_| async { Err(Error::Io(io::ErrorKind::ConnectionRefused.into())) })
            .await
            .unwrap_err();
        match err {
            Error::Io(source) => assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("expected an I/O error, got {other:?}"),
        }
    }
}

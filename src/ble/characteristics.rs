//! GATT characteristic resolution.
//!
//! Resolves a service/characteristic pair on a live session into a
//! [`Channel`] that can be read or written. Nothing is cached: handles are
//! not stable across reconnects, so every operation resolves afresh.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::connection::{Session, SessionHandle};
use crate::ble::uuids::Endpoint;
use crate::error::{Error, Result};

/// A resolved characteristic on a specific session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHandle {
    /// Service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
    /// Supports reads.
    pub readable: bool,
    /// Supports writes.
    pub writable: bool,
    /// Session generation the handle was resolved on.
    pub generation: u64,
}

/// Resolves endpoints against the services a session exposes.
#[derive(Debug, Clone)]
pub struct ChannelResolver {
    io_timeout: Duration,
}

impl ChannelResolver {
    /// Create a resolver whose channels time out I/O after `io_timeout`.
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    /// Resolve `endpoint` within `service` on `session`.
    ///
    /// # Errors
    ///
    /// `ChannelUnavailable` if the session is closed, the service is missing,
    /// or the service does not expose the endpoint.
    pub fn resolve(
        &self,
        session: &SessionHandle,
        service: Uuid,
        endpoint: Uuid,
    ) -> Result<Channel> {
        let live = session.upgrade().ok_or_else(|| Error::ChannelUnavailable {
            reason: format!("session {} is not connected", session.generation()),
        })?;

        let services = live.link().services();
        let found = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| {
                debug!("Service {} NOT found on device", service);
                for s in &services {
                    debug!("  Available service: {}", s.uuid);
                }
                Error::ChannelUnavailable {
                    reason: format!("service {} not exposed", service),
                }
            })?;

        let characteristic =
            found
                .characteristic(&endpoint)
                .ok_or_else(|| Error::ChannelUnavailable {
                    reason: format!("{} not exposed by {}", describe(&endpoint), service),
                })?;

        trace!("Resolved {} on session {}", describe(&endpoint), live.generation());

        Ok(Channel {
            handle: EndpointHandle {
                service,
                characteristic: endpoint,
                readable: characteristic.readable,
                writable: characteristic.writable,
                generation: live.generation(),
            },
            session: live,
            io_timeout: self.io_timeout,
        })
    }
}

/// Name a characteristic by its catalog endpoint when it is one.
fn describe(uuid: &Uuid) -> String {
    match Endpoint::from_uuid(uuid) {
        Some(endpoint) => format!("{} endpoint ({})", endpoint, uuid),
        None => format!("characteristic {}", uuid),
    }
}

/// A resolved endpoint bound to the session it was resolved on.
pub struct Channel {
    handle: EndpointHandle,
    session: Arc<Session>,
    io_timeout: Duration,
}

impl Channel {
    /// The resolved endpoint.
    pub fn handle(&self) -> &EndpointHandle {
        &self.handle
    }

    /// Whether the session the channel belongs to is still open.
    pub fn is_live(&self) -> bool {
        self.session.is_live()
    }

    /// Read the characteristic value.
    ///
    /// Fails with `ConnectionLost` if the session closed while the read was
    /// in flight, and with `Timeout` if it did not complete in time.
    pub async fn read(&self) -> Result<Vec<u8>> {
        if !self.handle.readable {
            return Err(Error::ChannelUnavailable {
                reason: format!("characteristic {} is not readable", self.handle.characteristic),
            });
        }

        let result = tokio::time::timeout(
            self.io_timeout,
            self.session
                .link()
                .read(self.handle.service, self.handle.characteristic),
        )
        .await
        .map_err(|_| Error::Timeout)?;

        match result {
            Ok(data) => {
                trace!(
                    "Read {} bytes from characteristic {}",
                    data.len(),
                    self.handle.characteristic
                );
                Ok(data)
            }
            Err(_) if !self.is_live() => Err(Error::ConnectionLost),
            Err(e) => Err(e),
        }
    }

    /// Write a value with response.
    ///
    /// Transport failures surface as `WriteRejected`.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.handle.writable {
            return Err(Error::ChannelUnavailable {
                reason: format!("characteristic {} is not writable", self.handle.characteristic),
            });
        }

        let result = tokio::time::timeout(
            self.io_timeout,
            self.session
                .link()
                .write(self.handle.service, self.handle.characteristic, data),
        )
        .await
        .map_err(|_| Error::Timeout)?;

        match result {
            Ok(()) => {
                trace!(
                    "Wrote {} bytes to characteristic {}",
                    data.len(),
                    self.handle.characteristic
                );
                Ok(())
            }
            Err(_) if !self.is_live() => Err(Error::ConnectionLost),
            Err(e) => Err(Error::WriteRejected {
                reason: e.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("handle", &self.handle)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::Connector;
    use crate::ble::mock::{FakeLink, FakeTransport};
    use crate::ble::uuids::CATALOG_SERVICE_UUID;
    use crate::config::SyncConfig;

    async fn connected(link: Arc<FakeLink>) -> (Connector, SessionHandle) {
        let connector = Connector::new(
            Arc::new(FakeTransport::new(link)),
            &SyncConfig::default(),
        );
        let handle = connector.connect().await.unwrap();
        (connector, handle)
    }

    fn resolver() -> ChannelResolver {
        ChannelResolver::new(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_each_endpoint() {
        let (_connector, session) = connected(Arc::new(FakeLink::catalog_device())).await;

        for endpoint in Endpoint::ALL {
            let channel = resolver()
                .resolve(&session, CATALOG_SERVICE_UUID, endpoint.uuid())
                .unwrap();
            assert_eq!(channel.handle().characteristic, endpoint.uuid());
            assert_eq!(channel.handle().readable, endpoint.is_read());
            assert_eq!(channel.handle().generation, session.generation());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_is_unavailable() {
        let (_connector, session) = connected(Arc::new(FakeLink::catalog_device())).await;

        let result = resolver().resolve(
            &session,
            Uuid::from_u128(0xdead),
            Endpoint::CatalogRead.uuid(),
        );
        assert!(matches!(result, Err(Error::ChannelUnavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_endpoint_is_unavailable() {
        let link = Arc::new(FakeLink::catalog_device());
        link.remove_endpoint(Endpoint::DeleteProduct);
        let (_connector, session) = connected(link).await;

        let result = resolver().resolve(
            &session,
            CATALOG_SERVICE_UUID,
            Endpoint::DeleteProduct.uuid(),
        );
        match result {
            Err(Error::ChannelUnavailable { reason }) => {
                assert!(reason.starts_with("delete-product endpoint"), "{}", reason);
            }
            other => panic!("expected ChannelUnavailable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_is_unavailable() {
        let (connector, session) = connected(Arc::new(FakeLink::catalog_device())).await;
        connector.disconnect().await.unwrap();

        let result = resolver().resolve(&session, CATALOG_SERVICE_UUID, Endpoint::CatalogRead.uuid());
        assert!(matches!(result, Err(Error::ChannelUnavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_write_rejected() {
        let link = Arc::new(FakeLink::catalog_device());
        link.fail_writes(true);
        let (_connector, session) = connected(link).await;

        let channel = resolver()
            .resolve(&session, CATALOG_SERVICE_UUID, Endpoint::AddProduct.uuid())
            .unwrap();
        let result = channel.write(b"{}").await;
        assert!(matches!(result, Err(Error::WriteRejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let link = Arc::new(FakeLink::catalog_device());
        let _gate = link.hold_reads();
        let (_connector, session) = connected(link).await;

        let channel = resolver()
            .resolve(&session, CATALOG_SERVICE_UUID, Endpoint::CatalogRead.uuid())
            .unwrap();
        assert!(matches!(channel.read().await, Err(Error::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_on_write_endpoint_is_unavailable() {
        let (_connector, session) = connected(Arc::new(FakeLink::catalog_device())).await;

        let channel = resolver()
            .resolve(&session, CATALOG_SERVICE_UUID, Endpoint::AddProduct.uuid())
            .unwrap();
        assert!(matches!(
            channel.read().await,
            Err(Error::ChannelUnavailable { .. })
        ));
    }
}

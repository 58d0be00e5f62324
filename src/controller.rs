//! Top-level handle tying the connector and the sync engine together.
//!
//! A [`Controller`] is what a display layer holds. It exposes the "connection
//! requested" trigger and the "catalog changed" observable, and runs a
//! background task that fetches the catalog whenever a session settles and
//! marks it stale whenever the link drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionState, Connector, ConnectorEvent, SessionHandle};
use crate::ble::scanner::BtleplugTransport;
use crate::ble::transport::BleTransport;
use crate::catalog_sync::{CatalogSync, SyncEvent, SyncFailure, SyncState};
use crate::config::SyncConfig;
use crate::data::{CatalogSnapshot, Price};
use crate::error::Result;

/// Handle to a registered callback. Unregisters when dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Owns the device connection and the local catalog.
pub struct Controller {
    connector: Arc<Connector>,
    engine: Arc<CatalogSync>,
    callback_counter: AtomicU64,
    auto_fetch: JoinHandle<()>,
}

impl Controller {
    /// Create a controller over `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn BleTransport>, config: &SyncConfig) -> Self {
        let connector = Arc::new(Connector::new(transport, config));
        let engine = Arc::new(CatalogSync::new(config));

        let auto_fetch = tokio::spawn(Self::auto_fetch(connector.subscribe(), engine.clone()));

        Self {
            connector,
            engine,
            callback_counter: AtomicU64::new(0),
            auto_fetch,
        }
    }

    /// Create a controller on the first system Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns `TransportUnsupported` if Bluetooth is not available.
    pub async fn with_btleplug(config: &SyncConfig) -> Result<Self> {
        let transport = BtleplugTransport::new(config.discovery_timeout).await?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// The connector.
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// The sync engine.
    pub fn engine(&self) -> &CatalogSync {
        &self.engine
    }

    // === Connection ===

    /// Start connecting in the background.
    ///
    /// Returns immediately; the outcome arrives through
    /// [`subscribe_connection`](Self::subscribe_connection) and, once the
    /// catalog is fetched, through [`watch_catalog`](Self::watch_catalog).
    pub fn request_connection(&self) {
        let connector = self.connector.clone();
        tokio::spawn(async move {
            if let Err(e) = connector.connect().await {
                debug!("Requested connection did not open: {}", e);
            }
        });
    }

    /// Connect and wait for the session to open.
    ///
    /// The catalog is fetched automatically once the session settles.
    pub async fn connect(&self) -> Result<SessionHandle> {
        self.connector.connect().await
    }

    /// Close the session. No reconnect is scheduled.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from catalog device");
        self.engine.mark_disconnected();
        self.connector.disconnect().await
    }

    /// Get the connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connector.state()
    }

    /// Subscribe to connector events.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.connector.subscribe()
    }

    // === Catalog ===

    /// Get the engine state.
    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    /// Current catalog.
    pub fn catalog(&self) -> CatalogSnapshot {
        self.engine.catalog()
    }

    /// Receiver notified whenever the catalog changes.
    pub fn watch_catalog(&self) -> watch::Receiver<CatalogSnapshot> {
        self.engine.watch_catalog()
    }

    /// Subscribe to engine events.
    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// The most recent failure, for display.
    pub fn last_failure(&self) -> Option<SyncFailure> {
        self.engine.last_failure()
    }

    /// Dismiss the displayed failure.
    pub fn clear_failure(&self) {
        self.engine.clear_failure();
    }

    /// Re-read the catalog on the current session.
    pub async fn refresh(&self) -> Result<usize> {
        self.engine
            .fetch_catalog(self.connector.session().as_ref())
            .await
    }

    /// Add a product.
    pub async fn add_product(&self, name: &str, price: Price, barcode: &str) -> Result<()> {
        self.engine
            .add_product(self.connector.session().as_ref(), name, price, barcode)
            .await
    }

    /// Change the price of a product.
    pub async fn update_price(&self, name: &str, price: Price, barcode: &str) -> Result<()> {
        self.engine
            .update_price(self.connector.session().as_ref(), name, price, barcode)
            .await
    }

    /// Delete every product with `barcode`.
    pub async fn delete_product(&self, barcode: &str) -> Result<()> {
        self.engine
            .delete_product(self.connector.session().as_ref(), barcode)
            .await
    }

    /// Record an edited price without sending it.
    pub fn set_price_draft(&self, barcode: &str, price: Price) {
        self.engine.set_price_draft(barcode, price);
    }

    /// The edited price for `barcode`.
    pub fn price_draft(&self, barcode: &str) -> Option<Price> {
        self.engine.price_draft(barcode)
    }

    /// Send the edited price for `barcode`.
    pub async fn commit_price_draft(&self, barcode: &str) -> Result<()> {
        self.engine
            .commit_price_draft(self.connector.session().as_ref(), barcode)
            .await
    }

    // === Callbacks ===

    /// Register a callback for catalog changes.
    pub fn on_catalog_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&CatalogSnapshot) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.engine.watch_catalog();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                callback(&snapshot);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for engine events.
    pub fn on_sync_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.engine.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Sync event callback lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    async fn auto_fetch(mut events: broadcast::Receiver<ConnectorEvent>, engine: Arc<CatalogSync>) {
        loop {
            match events.recv().await {
                Ok(ConnectorEvent::Ready(session)) => {
                    // Failures are already reported by the engine.
                    let _ = engine.fetch_catalog(Some(&session)).await;
                }
                Ok(ConnectorEvent::ConnectionLost { generation }) => {
                    debug!("Session {} lost, catalog is stale", generation);
                    engine.mark_disconnected();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Auto-fetch missed {} connector events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }

        debug!("Auto-fetch task ended");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.auto_fetch.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{FakeLink, FakeTransport};
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    const SEED: &[u8] = br#"[{"name":"Tea","price":2.5,"barcode":"100"}]"#;

    fn controller() -> (Arc<FakeLink>, Arc<FakeTransport>, Controller) {
        let link = Arc::new(FakeLink::catalog_device());
        link.set_catalog(SEED);
        let transport = Arc::new(FakeTransport::new(link.clone()));
        let controller = Controller::new(transport.clone(), &SyncConfig::default());
        (link, transport, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_fetched_after_settle() {
        let (_link, _transport, controller) = controller();

        controller.connect().await.unwrap();
        assert_eq!(controller.sync_state(), SyncState::Idle);

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(controller.sync_state(), SyncState::Ready);

        let catalog = controller.catalog();
        assert!(catalog.fresh);
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_connection_is_fire_and_forget() {
        let (_link, _transport, controller) = controller();
        let mut catalog = controller.watch_catalog();

        controller.request_connection();
        catalog.changed().await.unwrap();

        assert_eq!(controller.connection_state(), ConnectionState::Connected);
        assert_eq!(catalog.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_marks_stale_then_refetches() {
        let (link, transport, controller) = controller();
        controller.connect().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        link.drop_link();
        sleep(Duration::from_millis(10)).await;
        assert!(!controller.catalog().fresh);
        assert_eq!(controller.sync_state(), SyncState::Idle);
        assert_eq!(controller.catalog().len(), 1);

        link.set_catalog(b"[]");
        sleep(Duration::from_millis(6_500)).await;

        assert_eq!(transport.attempts(), 2);
        assert_eq!(controller.sync_state(), SyncState::Ready);
        let catalog = controller.catalog();
        assert!(catalog.fresh);
        assert!(catalog.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_marks_stale_without_reconnect() {
        let (_link, transport, controller) = controller();
        controller.connect().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        controller.disconnect().await.unwrap();
        assert_eq!(controller.sync_state(), SyncState::Idle);
        assert!(!controller.catalog().fresh);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_before_fetch_is_rejected() {
        let (link, _transport, controller) = controller();

        let result = controller
            .add_product("Jam", Price::from_cents(400), "300")
            .await;
        assert!(matches!(result, Err(Error::CatalogNotReady { .. })));
        assert!(link.writes().is_empty());
        assert!(controller.last_failure().is_some());

        controller.clear_failure();
        assert!(controller.last_failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_flow_through_session() {
        let (link, _transport, controller) = controller();
        controller.connect().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        controller
            .add_product("Jam", Price::from_cents(400), "300")
            .await
            .unwrap();
        controller
            .update_price("Tea", Price::from_cents(275), "100")
            .await
            .unwrap();
        controller.set_price_draft("300", Price::from_cents(450));
        controller.commit_price_draft("300").await.unwrap();
        controller.delete_product("100").await.unwrap();

        assert_eq!(link.writes().len(), 4);
        let catalog = controller.catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.products[0].price, Price::from_cents(450));
        assert_eq!(controller.price_draft("100"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rereads_catalog() {
        let (link, _transport, controller) = controller();
        controller.connect().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        link.set_catalog(br#"[{"name":"A","price":1,"barcode":"1"},{"name":"B","price":2,"barcode":"2"}]"#);
        assert_eq!(controller.refresh().await.unwrap(), 2);
        assert_eq!(controller.catalog().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_callback_unregisters_on_drop() {
        let (_link, _transport, controller) = controller();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = controller.on_catalog_changed({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        controller.connect().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(handle);
        controller.refresh().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_event_callback() {
        let (_link, _transport, controller) = controller();
        let replaced = Arc::new(AtomicUsize::new(0));

        let handle = controller.on_sync_event({
            let replaced = replaced.clone();
            move |event| {
                if let SyncEvent::CatalogReplaced { count } = event {
                    replaced.store(*count, Ordering::SeqCst);
                }
            }
        });
        assert_eq!(handle.id(), 0);

        controller.connect().await.unwrap();
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(replaced.load(Ordering::SeqCst), 1);

        handle.unregister();
    }
}

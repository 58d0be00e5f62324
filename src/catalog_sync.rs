//! Catalog sync engine.
//!
//! Reads the product list from the device and pushes add/update/delete
//! commands to it, keeping the [`LocalCatalog`] in step.
//!
//! ```text
//!  Idle ──fetch──► Fetching ──ok──► Ready ◄──┐
//!                                     │      │ success or failure
//!                                     └──► Adding / Updating / Deleting
//! ```
//!
//! Writes are optimistic: once the device acknowledges a write the change is
//! applied locally without reading the catalog back. Every operation runs
//! under a single-flight lock, so two operations never interleave on one
//! session.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::characteristics::{Channel, ChannelResolver};
use crate::ble::connection::SessionHandle;
use crate::ble::uuids::Endpoint;
use crate::config::{DuplicatePolicy, SyncConfig};
use crate::data::{CatalogSnapshot, LocalCatalog, Price, Product};
use crate::error::{Error, Result};
use crate::protocol::codec::{self, Command};

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncState {
    /// No catalog fetched on the current connection.
    #[default]
    Idle,
    /// Reading the catalog.
    Fetching,
    /// Catalog fetched; writes allowed.
    Ready,
    /// Writing `ADD_PRODUCT`.
    Adding,
    /// Writing `UPDATE_PRICE`.
    Updating,
    /// Writing `DELETE_PRODUCT`.
    Deleting,
}

impl SyncState {
    /// Check if an operation is in flight.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ready)
    }

    fn for_command(command: &Command) -> Self {
        match command {
            Command::AddProduct { .. } => Self::Adding,
            Command::UpdatePrice { .. } => Self::Updating,
            Command::DeleteProduct { .. } => Self::Deleting,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Ready => write!(f, "Ready"),
            Self::Adding => write!(f, "Adding"),
            Self::Updating => write!(f, "Updating"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Which engine operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `fetch_catalog`.
    Fetch,
    /// `add_product`.
    Add,
    /// `update_price`.
    UpdatePrice,
    /// `delete_product`.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch catalog"),
            Self::Add => write!(f, "add product"),
            Self::UpdatePrice => write!(f, "update price"),
            Self::Delete => write!(f, "delete product"),
        }
    }
}

/// A reported failure, kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// The operation that failed.
    pub operation: Operation,
    /// Human-readable error.
    pub message: String,
    /// When it failed.
    pub at: DateTime<Utc>,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to {}: {}", self.operation, self.message)
    }
}

/// Event emitted by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The engine state changed.
    StateChanged(SyncState),
    /// A fetch replaced the catalog.
    CatalogReplaced {
        /// Number of products fetched.
        count: usize,
    },
    /// A command was acknowledged and applied locally.
    CommandApplied(Command),
    /// An operation failed; local state is unchanged.
    Failed(SyncFailure),
}

/// The catalog sync engine.
pub struct CatalogSync {
    resolver: ChannelResolver,
    service: Uuid,
    duplicate_policy: DuplicatePolicy,
    catalog: LocalCatalog,
    state: RwLock<SyncState>,
    /// Serializes operations.
    flight: Mutex<()>,
    last_failure: RwLock<Option<SyncFailure>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl CatalogSync {
    /// Create an engine with an empty catalog.
    pub fn new(config: &SyncConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            resolver: ChannelResolver::new(config.io_timeout),
            service: config.service_uuid,
            duplicate_policy: config.duplicate_policy,
            catalog: LocalCatalog::new(),
            state: RwLock::new(SyncState::Idle),
            flight: Mutex::new(()),
            last_failure: RwLock::new(None),
            event_tx,
        }
    }

    // === State ===

    /// Get the current engine state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Current catalog.
    pub fn catalog(&self) -> CatalogSnapshot {
        self.catalog.snapshot()
    }

    /// Receiver notified whenever the catalog changes.
    pub fn watch_catalog(&self) -> watch::Receiver<CatalogSnapshot> {
        self.catalog.subscribe()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// The most recent failure, for display.
    pub fn last_failure(&self) -> Option<SyncFailure> {
        self.last_failure.read().clone()
    }

    /// Dismiss the displayed failure.
    pub fn clear_failure(&self) {
        *self.last_failure.write() = None;
    }

    /// The link dropped: fall back to `Idle` and stop trusting the catalog.
    ///
    /// Does not wait for in-flight operations; they discard their results on
    /// their own.
    pub fn mark_disconnected(&self) {
        let state = self.state();
        if state.is_busy() {
            debug!("Link dropped while {}; result will be discarded", state);
        }
        self.catalog.mark_stale();
        self.set_state(SyncState::Idle);
    }

    // === Operations ===

    /// Read the full catalog and replace local state with it.
    ///
    /// Returns the number of products fetched.
    pub async fn fetch_catalog(&self, session: Option<&SessionHandle>) -> Result<usize> {
        let _flight = self.flight.lock().await;

        let previous = self.state();
        self.set_state(SyncState::Fetching);

        let fetched = self.read_catalog(session).await.and_then(|(products, channel)| {
            let count = products.len();
            // The liveness check and the replacement happen under one lock.
            if self
                .catalog
                .replace_if(products, Utc::now(), || channel.is_live())
            {
                Ok(count)
            } else {
                debug!("Discarding catalog read from a closed session");
                Err(Error::ConnectionLost)
            }
        });

        match fetched {
            Ok(count) => {
                self.set_state(SyncState::Ready);
                info!("Fetched {} products from device", count);
                self.emit(SyncEvent::CatalogReplaced { count });
                Ok(count)
            }
            Err(e) => {
                self.settle_after_failure(session, previous);
                Err(self.report(Operation::Fetch, e))
            }
        }
    }

    /// Add a product. On success it is appended locally.
    ///
    /// With the default [`DuplicatePolicy::Admit`] an existing barcode is not
    /// checked, so the catalog ends up holding two entries for it.
    pub async fn add_product(
        &self,
        session: Option<&SessionHandle>,
        name: &str,
        price: Price,
        barcode: &str,
    ) -> Result<()> {
        if let Err(e) = validate(name, price, barcode) {
            return Err(self.report(Operation::Add, e));
        }

        let command = Command::AddProduct {
            name: name.to_string(),
            price,
            barcode: barcode.to_string(),
        };
        self.execute(session, Operation::Add, command).await
    }

    /// Change the price of the product with `barcode`.
    ///
    /// If no such product exists locally the command is still sent, and the
    /// local catalog is left as is.
    pub async fn update_price(
        &self,
        session: Option<&SessionHandle>,
        name: &str,
        price: Price,
        barcode: &str,
    ) -> Result<()> {
        if let Err(e) = validate(name, price, barcode) {
            return Err(self.report(Operation::UpdatePrice, e));
        }

        let command = Command::UpdatePrice {
            name: name.to_string(),
            price,
            barcode: barcode.to_string(),
        };
        self.execute(session, Operation::UpdatePrice, command).await
    }

    /// Delete every product with `barcode`. Absent barcodes are not an error.
    pub async fn delete_product(&self, session: Option<&SessionHandle>, barcode: &str) -> Result<()> {
        if barcode.trim().is_empty() {
            return Err(self.report(Operation::Delete, Error::invalid("barcode", barcode)));
        }

        let command = Command::DeleteProduct {
            barcode: barcode.to_string(),
        };
        self.execute(session, Operation::Delete, command).await
    }

    // === Price drafts ===

    /// Record an edited price without sending it.
    pub fn set_price_draft(&self, barcode: &str, price: Price) {
        self.catalog.set_draft(barcode, price);
    }

    /// The edited price for `barcode`.
    pub fn price_draft(&self, barcode: &str) -> Option<Price> {
        self.catalog.draft(barcode)
    }

    /// Send the draft price for `barcode` as an `UPDATE_PRICE`.
    pub async fn commit_price_draft(&self, session: Option<&SessionHandle>, barcode: &str) -> Result<()> {
        let snapshot = self.catalog.snapshot();
        let Some(product) = snapshot.find(barcode) else {
            return Err(self.report(Operation::UpdatePrice, Error::invalid("barcode", barcode)));
        };
        let Some(price) = snapshot.price_drafts.get(barcode).copied() else {
            return Err(self.report(Operation::UpdatePrice, Error::invalid("price draft", barcode)));
        };

        self.update_price(session, &product.name, price, barcode).await
    }

    // === Internal ===

    async fn read_catalog(&self, session: Option<&SessionHandle>) -> Result<(Vec<Product>, Channel)> {
        let session = session.ok_or(Error::NotConnected)?;
        let channel = self
            .resolver
            .resolve(session, self.service, Endpoint::CatalogRead.uuid())?;

        let payload = channel.read().await?;
        let products = codec::decode(&payload)?;

        Ok((products, channel))
    }

    async fn execute(
        &self,
        session: Option<&SessionHandle>,
        operation: Operation,
        command: Command,
    ) -> Result<()> {
        let _flight = self.flight.lock().await;

        let state = self.state();
        if state != SyncState::Ready {
            return Err(self.report(
                operation,
                Error::CatalogNotReady {
                    state: state.to_string(),
                },
            ));
        }

        if let Command::AddProduct { barcode, .. } = &command {
            if self.duplicate_policy == DuplicatePolicy::Reject
                && self.catalog.snapshot().find(barcode).is_some()
            {
                return Err(self.report(
                    operation,
                    Error::DuplicateBarcode {
                        barcode: barcode.clone(),
                    },
                ));
            }
        }

        self.set_state(SyncState::for_command(&command));

        match self.write_command(session, &command).await {
            Ok(()) => {
                self.apply_confirmed(&command);
                self.set_state(SyncState::Ready);
                info!("Applied {}", command);
                self.emit(SyncEvent::CommandApplied(command));
                Ok(())
            }
            Err(e) => {
                self.settle_after_failure(session, SyncState::Ready);
                Err(self.report(operation, e))
            }
        }
    }

    async fn write_command(&self, session: Option<&SessionHandle>, command: &Command) -> Result<()> {
        let session = session.ok_or(Error::NotConnected)?;
        let channel = self
            .resolver
            .resolve(session, self.service, command.endpoint().uuid())?;

        let payload = codec::encode(command)?;
        channel.write(&payload).await?;

        if !channel.is_live() {
            debug!("Discarding acknowledgement of {} from a closed session", command);
            return Err(Error::ConnectionLost);
        }

        Ok(())
    }

    /// Apply an acknowledged command to the local catalog.
    ///
    /// This is the only place local state changes after a write.
    fn apply_confirmed(&self, command: &Command) {
        match command {
            Command::AddProduct {
                name,
                price,
                barcode,
            } => {
                self.catalog
                    .append(Product::new(name.clone(), *price, barcode.clone()));
            }
            Command::UpdatePrice { price, barcode, .. } => {
                if self.catalog.set_price(barcode, *price) == 0 {
                    debug!("No local product with barcode {}", barcode);
                }
            }
            Command::DeleteProduct { barcode } => {
                let removed = self.catalog.remove(barcode);
                debug!("Removed {} local entries for barcode {}", removed, barcode);
            }
        }
    }

    /// Return to `fallback` if the session survived, else to `Idle`.
    fn settle_after_failure(&self, session: Option<&SessionHandle>, fallback: SyncState) {
        let live = session.map(SessionHandle::is_live).unwrap_or(false);
        self.set_state(if live { fallback } else { SyncState::Idle });
    }

    /// Log, record and broadcast a failure; hand the error back.
    fn report(&self, operation: Operation, error: Error) -> Error {
        if error.is_auto_recovered() {
            info!("Failed to {}: {} (reconnect pending)", operation, error);
        } else {
            warn!("Failed to {}: {}", operation, error);
        }

        let failure = SyncFailure {
            operation,
            message: error.to_string(),
            at: Utc::now(),
        };
        *self.last_failure.write() = Some(failure.clone());
        self.emit(SyncEvent::Failed(failure));

        error
    }

    fn set_state(&self, new_state: SyncState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);

        if old_state != new_state {
            debug!("Sync state changed: {} -> {}", old_state, new_state);
            self.emit(SyncEvent::StateChanged(new_state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn validate(name: &str, price: Price, barcode: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid("name", name));
    }
    if price.is_negative() {
        return Err(Error::invalid("price", price));
    }
    if barcode.trim().is_empty() {
        return Err(Error::invalid("barcode", barcode));
    }
    Ok(())
}

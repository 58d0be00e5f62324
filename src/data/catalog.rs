//! Local catalog state.
//!
//! [`LocalCatalog`] is the in-memory mirror of the device's product list. It
//! is published through a `tokio::sync::watch` channel so a display layer can
//! render every change; each mutation is applied inside a single
//! `send_modify`, so readers never observe a half-applied update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;

use crate::data::price::Price;

/// A product as stored on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Product {
    /// Display name.
    pub name: String,
    /// Unit price.
    pub price: Price,
    /// Identity key.
    pub barcode: String,
}

impl Product {
    /// Create a new product.
    pub fn new(name: impl Into<String>, price: Price, barcode: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            price,
            barcode: barcode.into(),
        }
    }
}

/// Point-in-time view of the local catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Products in arrival order.
    pub products: Vec<Product>,
    /// Draft prices keyed by barcode, not yet sent to the device.
    pub price_drafts: HashMap<String, Price>,
    /// True between a successful fetch and the next disconnect.
    pub fresh: bool,
    /// When the last successful fetch completed.
    pub synced_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    /// Number of products.
    pub fn len(&self) -> usize {
        self.products.len()
    }

    /// Check if there are no products.
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// First product with `barcode`.
    pub fn find(&self, barcode: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.barcode == barcode)
    }

    /// Number of entries carrying `barcode`.
    pub fn count(&self, barcode: &str) -> usize {
        self.products.iter().filter(|p| p.barcode == barcode).count()
    }
}

/// The observable local catalog.
#[derive(Debug)]
pub struct LocalCatalog {
    tx: watch::Sender<CatalogSnapshot>,
}

impl Default for LocalCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCatalog {
    /// Create an empty, stale catalog.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CatalogSnapshot::default());
        Self { tx }
    }

    /// Current state.
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.tx.subscribe()
    }

    /// Replace everything with a fetched list and reseed drafts from it.
    pub fn replace(&self, products: Vec<Product>, synced_at: DateTime<Utc>) {
        self.replace_if(products, synced_at, || true);
    }

    /// Like [`replace`](Self::replace), but only if `still_valid` holds when
    /// checked under the write lock. Returns whether the catalog was replaced.
    pub fn replace_if(
        &self,
        products: Vec<Product>,
        synced_at: DateTime<Utc>,
        still_valid: impl FnOnce() -> bool,
    ) -> bool {
        self.tx.send_if_modified(|state| {
            if !still_valid() {
                return false;
            }
            state.price_drafts = products
                .iter()
                .map(|p| (p.barcode.clone(), p.price))
                .collect();
            state.products = products;
            state.fresh = true;
            state.synced_at = Some(synced_at);
            true
        })
    }

    /// Append a product and seed its draft. No uniqueness check.
    pub fn append(&self, product: Product) {
        self.tx.send_modify(|state| {
            state.price_drafts.insert(product.barcode.clone(), product.price);
            state.products.push(product);
        });
    }

    /// Set the price of every product with `barcode`. Returns how many matched.
    pub fn set_price(&self, barcode: &str, price: Price) -> usize {
        let mut matched = 0;
        self.tx.send_if_modified(|state| {
            for product in state.products.iter_mut().filter(|p| p.barcode == barcode) {
                product.price = price;
                matched += 1;
            }
            matched > 0
        });
        matched
    }

    /// Remove every product with `barcode` and its draft. Returns how many went.
    pub fn remove(&self, barcode: &str) -> usize {
        let mut removed = 0;
        self.tx.send_if_modified(|state| {
            let before = state.products.len();
            state.products.retain(|p| p.barcode != barcode);
            removed = before - state.products.len();
            let had_draft = state.price_drafts.remove(barcode).is_some();
            removed > 0 || had_draft
        });
        removed
    }

    /// Record a draft price.
    pub fn set_draft(&self, barcode: &str, price: Price) {
        self.tx.send_modify(|state| {
            state.price_drafts.insert(barcode.to_string(), price);
        });
    }

    /// Draft price for `barcode`.
    pub fn draft(&self, barcode: &str) -> Option<Price> {
        self.tx.borrow().price_drafts.get(barcode).copied()
    }

    /// Flag the contents as no longer trustworthy.
    pub fn mark_stale(&self) {
        self.tx.send_if_modified(|state| std::mem::replace(&mut state.fresh, false));
    }
}

//! Data structures for the local catalog.
//!
//! This module contains the product and price types and the observable
//! in-memory catalog the sync engine maintains.

pub mod catalog;
pub mod price;

pub use catalog::{CatalogSnapshot, LocalCatalog, Product};
pub use price::Price;

//! Command and catalog wire encoding.
//!
//! The device firmware speaks UTF-8 JSON:
//!
//! - Commands are single objects tagged by a `command` field, e.g.
//!   `{"command":"ADD_PRODUCT","name":"Tea","price":2.5,"barcode":"42"}`.
//! - The catalog characteristic returns an array of
//!   `{"name":..,"price":..,"barcode":..}` objects.
//!
//! Command encoding is one-way; the device never sends commands back.

use bytes::Bytes;
use serde::de::{self, value::MapAccessDeserializer, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::ble::uuids::Endpoint;
use crate::data::{Price, Product};
use crate::error::{Error, Result};

/// A mutating instruction for the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Add a product.
    AddProduct {
        /// Display name.
        name: String,
        /// Unit price.
        price: Price,
        /// Identity key.
        barcode: String,
    },
    /// Change the price of a product.
    UpdatePrice {
        /// Display name (sent along, not used as a key).
        name: String,
        /// New price.
        price: Price,
        /// Identity key.
        barcode: String,
    },
    /// Delete every product with a barcode.
    DeleteProduct {
        /// Identity key.
        barcode: String,
    },
}

impl Command {
    /// The barcode the command targets.
    pub fn barcode(&self) -> &str {
        match self {
            Self::AddProduct { barcode, .. }
            | Self::UpdatePrice { barcode, .. }
            | Self::DeleteProduct { barcode } => barcode,
        }
    }

    /// The endpoint the command is written to.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::AddProduct { .. } => Endpoint::AddProduct,
            Self::UpdatePrice { .. } => Endpoint::UpdatePrice,
            Self::DeleteProduct { .. } => Endpoint::DeleteProduct,
        }
    }

    /// The wire tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AddProduct { .. } => "ADD_PRODUCT",
            Self::UpdatePrice { .. } => "UPDATE_PRICE",
            Self::DeleteProduct { .. } => "DELETE_PRODUCT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tag(), self.barcode())
    }
}

/// Encode a command as UTF-8 JSON.
pub fn encode(command: &Command) -> Result<Bytes> {
    serde_json::to_vec(command)
        .map(Bytes::from)
        .map_err(|e| Error::Internal(format!("failed to encode {}: {}", command, e)))
}

/// A catalog entry as the firmware writes it.
#[derive(Deserialize)]
struct WireProduct {
    name: String,
    price: Price,
    #[serde(deserialize_with = "barcode_text")]
    barcode: String,
}

/// Barcodes come through as strings or as bare integers depending on how
/// they were entered.
fn barcode_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    deserializer.deserialize_any(BarcodeVisitor)
}

struct BarcodeVisitor;

impl<'de> Visitor<'de> for BarcodeVisitor {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a barcode as a string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<String, E> {
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    /// Arbitrary-precision numbers arrive as a one-entry map.
    fn visit_map<A: MapAccess<'de>>(self, map: A) -> std::result::Result<String, A::Error> {
        let number = serde_json::Number::deserialize(MapAccessDeserializer::new(map))?;
        if number.is_u64() || number.is_i64() {
            Ok(number.to_string())
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Other("non-integer number"),
                &self,
            ))
        }
    }
}

/// Decode the catalog characteristic value.
///
/// # Errors
///
/// `MalformedCatalog` for anything that is not a UTF-8 JSON array of
/// well-formed products.
pub fn decode(payload: &[u8]) -> Result<Vec<Product>> {
    let wire: Vec<WireProduct> =
        serde_json::from_slice(payload).map_err(|e| Error::MalformedCatalog {
            reason: e.to_string(),
        })?;

    Ok(wire
        .into_iter()
        .map(|p| Product {
            name: p.name,
            price: p.price,
            barcode: p.barcode,
        })
        .collect())
}

//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants exposed by the catalog device firmware.

use std::fmt;
use uuid::Uuid;

/// Catalog service UUID. Also the discovery filter.
pub const CATALOG_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ab);
/// Product list characteristic UUID (Read).
pub const PRODUCT_LIST_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ac);
/// Add product characteristic UUID (Write).
pub const ADD_PRODUCT_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ad);
/// Update price characteristic UUID (Write).
pub const UPDATE_PRICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ae);
/// Delete product characteristic UUID (Write).
pub const DELETE_PRODUCT_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890af);

/// The logical endpoints of the catalog service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Full catalog read.
    CatalogRead,
    /// `ADD_PRODUCT` command sink.
    AddProduct,
    /// `UPDATE_PRICE` command sink.
    UpdatePrice,
    /// `DELETE_PRODUCT` command sink.
    DeleteProduct,
}

impl Endpoint {
    /// All endpoints, in characteristic order.
    pub const ALL: [Endpoint; 4] = [
        Endpoint::CatalogRead,
        Endpoint::AddProduct,
        Endpoint::UpdatePrice,
        Endpoint::DeleteProduct,
    ];

    /// Characteristic UUID for this endpoint.
    pub fn uuid(self) -> Uuid {
        match self {
            Self::CatalogRead => PRODUCT_LIST_UUID,
            Self::AddProduct => ADD_PRODUCT_UUID,
            Self::UpdatePrice => UPDATE_PRICE_UUID,
            Self::DeleteProduct => DELETE_PRODUCT_UUID,
        }
    }

    /// Look up an endpoint by characteristic UUID.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.uuid() == *uuid)
    }

    /// Whether the endpoint is read (as opposed to written).
    pub fn is_read(self) -> bool {
        matches!(self, Self::CatalogRead)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CatalogRead => write!(f, "catalog-read"),
            Self::AddProduct => write!(f, "add-product"),
            Self::UpdatePrice => write!(f, "update-price"),
            Self::DeleteProduct => write!(f, "delete-product"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            CATALOG_SERVICE_UUID.to_string(),
            "12345678-1234-1234-1234-1234567890ab"
        );
        assert_eq!(
            DELETE_PRODUCT_UUID.to_string(),
            "12345678-1234-1234-1234-1234567890af"
        );
    }

    #[test]
    fn test_endpoint_lookup() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::from_uuid(&endpoint.uuid()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_uuid(&CATALOG_SERVICE_UUID), None);
    }

    #[test]
    fn test_only_catalog_is_read() {
        assert!(Endpoint::CatalogRead.is_read());
        assert!(!Endpoint::AddProduct.is_read());
        assert_eq!(Endpoint::UpdatePrice.to_string(), "update-price");
    }
}

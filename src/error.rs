//! Error types for the catalog-sync-ble crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Nothing in here is fatal to the process: every variant is recoverable by
/// retrying the triggering action or waiting for an automatic reconnect.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The platform cannot open a Bluetooth LE transport.
    #[error("Bluetooth transport unsupported: {reason}")]
    TransportUnsupported {
        /// Why the transport could not be opened.
        reason: String,
    },

    /// Discovery was cancelled or no matching device was found.
    #[error("Device discovery aborted: {reason}")]
    DiscoveryAborted {
        /// Why discovery ended without a device.
        reason: String,
    },

    /// The link to the device dropped after it was established.
    #[error("Connection lost")]
    ConnectionLost,

    /// Operation requires a session but none is open.
    #[error("Device not connected")]
    NotConnected,

    /// A connection attempt is already running.
    #[error("Connection already in progress")]
    ConnectInProgress,

    /// A voluntary disconnect arrived while the connection was being opened.
    #[error("Connection attempt cancelled by disconnect")]
    ConnectCancelled,

    /// The requested service or characteristic is not reachable.
    #[error("Channel unavailable: {reason}")]
    ChannelUnavailable {
        /// Which service/characteristic lookup failed.
        reason: String,
    },

    /// The catalog payload read from the device could not be decoded.
    #[error("Malformed catalog: {reason}")]
    MalformedCatalog {
        /// Decoder diagnostic.
        reason: String,
    },

    /// Writing a command to the device failed.
    #[error("Write rejected: {reason}")]
    WriteRejected {
        /// Transport diagnostic.
        reason: String,
    },

    /// A write was attempted before the catalog was fetched on this connection.
    #[error("Catalog not ready (state: {state})")]
    CatalogNotReady {
        /// The sync engine state at the time of the call.
        state: String,
    },

    /// The barcode is already present and duplicates are rejected.
    #[error("Duplicate barcode: {barcode}")]
    DuplicateBarcode {
        /// The offending barcode.
        barcode: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An endpoint read or write did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidParameter`].
    pub(crate) fn invalid(name: &str, value: impl ToString) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// Whether the connector will recover from this on its own.
    pub fn is_auto_recovered(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

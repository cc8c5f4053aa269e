//! Error taxonomy for links, requests and the registry facade.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the platform transport driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport rejected the operation: {0}")]
    Rejected(String),
    #[error("GATT status failure: {0}")]
    GattStatus(u8),
    #[error("Link is not open")]
    NotConnected,
    #[error("Radio adapter is disabled")]
    AdapterDisabled,
    #[error("Operation not supported by this transport")]
    Unsupported,
}

/// Terminal failure of a request, delivered through callbacks and events.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestError {
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Request timed out")]
    RequestTimeout,
    #[error("Device is not connectable")]
    UnconnectableDevice,
    #[error("Transport rejected request: {0}")]
    TransportRejected(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Bluetooth adapter is off")]
    AdapterOff,
    #[error("Link lost while request was pending")]
    Disconnected,
    #[error("Service not found")]
    ServiceNotFound,
    #[error("Characteristic not found")]
    CharacteristicNotFound,
    #[error("Descriptor not found")]
    DescriptorNotFound,
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AdapterDisabled => RequestError::AdapterOff,
            TransportError::NotConnected => RequestError::Disconnected,
            other => RequestError::TransportRejected(other.to_string()),
        }
    }
}

/// Errors returned by [`crate::Registry`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Device is not connectable: {0}")]
    UnconnectableDevice(String),
    #[error("No connection for address: {0}")]
    ConnectionNotFound(String),
    #[error("Device creator rejected address: {0}")]
    DeviceRejected(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_maps_to_request_error() {
        assert_eq!(
            RequestError::from(TransportError::AdapterDisabled),
            RequestError::AdapterOff
        );
        assert_eq!(
            RequestError::from(TransportError::NotConnected),
            RequestError::Disconnected
        );
        assert!(matches!(
            RequestError::from(TransportError::GattStatus(133)),
            RequestError::TransportRejected(msg) if msg.contains("133")
        ));
    }
}

//! Device identity and connection-state snapshot for one physical peer.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable device address, normalized to upper case (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create a normalized address
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    /// Borrow the address string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address::new(value)
    }
}

/// Connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link open in progress
    Connecting,
    /// Link open, services not yet discovered
    Connected,
    /// Service discovery in flight
    ServiceDiscovering,
    /// Services discovered; requests may execute
    ServiceDiscovered,
    /// Waiting for the device to show up again before the next attempt
    ScanningForReconnection,
    /// Terminal
    Released,
}

impl ConnectionState {
    /// Whether a low-level link is (or is being) held
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::ServiceDiscovering
                | ConnectionState::ServiceDiscovered
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::ServiceDiscovering => "SERVICE_DISCOVERING",
            ConnectionState::ServiceDiscovered => "SERVICE_DISCOVERED",
            ConnectionState::ScanningForReconnection => "SCANNING_FOR_RECONNECTION",
            ConnectionState::Released => "RELEASED",
        };
        f.write_str(name)
    }
}

/// A physical peer. Shared as `Arc<Device>` between the registry, its
/// connection and observers.
#[derive(Debug)]
pub struct Device {
    address: Address,
    name: RwLock<String>,
    connectable: Option<bool>,
    rssi: RwLock<i16>,
    state: RwLock<ConnectionState>,
}

impl Device {
    /// Create a device known only by address
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            name: RwLock::new(String::new()),
            connectable: None,
            rssi: RwLock::new(-120),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Set the advertised name
    pub fn with_name(self, name: impl Into<String>) -> Self {
        *self.name.write() = name.into();
        self
    }

    /// Set the advertised connectability flag
    pub fn with_connectable(mut self, connectable: bool) -> Self {
        self.connectable = Some(connectable);
        self
    }

    /// Set the last seen signal strength
    pub fn with_rssi(self, rssi: i16) -> Self {
        *self.rssi.write() = rssi;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Advertised connectability; `None` when the advertisement did not say
    pub fn connectable(&self) -> Option<bool> {
        self.connectable
    }

    /// Unknown connectability counts as connectable
    pub fn is_connectable(&self) -> bool {
        self.connectable != Some(false)
    }

    pub fn rssi(&self) -> i16 {
        *self.rssi.read()
    }

    pub fn set_rssi(&self, rssi: i16) {
        *self.rssi.write() = rssi;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::ServiceDiscovered
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::Disconnected | ConnectionState::Released
        )
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[name: {}, addr: {}]", self.name(), self.address)
    }
}

// Transport module: the command surface driven by connections

pub mod gatt;
pub mod sim;

pub use gatt::{
    find_characteristic, uuid_from_u16, CharacteristicProperty, CharacteristicRef,
    DescriptorRef, GattCharacteristic, GattService, CLIENT_CHARACTERISTIC_CONFIG,
};
pub use sim::{SimulatedTransport, WriteRecord};

use crate::config::WriteType;
use crate::device::Address;
use crate::error::TransportError;
use crate::scanner::ScannerKind;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Acknowledgment of one submitted write chunk
pub type PendingAck = BoxFuture<'static, Result<(), TransportError>>;

/// LE PHY identifiers
pub const PHY_LE_1M: u8 = 1;
pub const PHY_LE_2M: u8 = 2;
pub const PHY_LE_CODED: u8 = 3;

/// Transmitter and receiver PHY of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phy {
    pub tx: u8,
    pub rx: u8,
}

impl Default for Phy {
    fn default() -> Self {
        Self {
            tx: PHY_LE_1M,
            rx: PHY_LE_1M,
        }
    }
}

/// What the radio stack can do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Advertisement scanner (BLE 4.x+ scanner API)
    pub le_scan: bool,
    /// Legacy LE scan callback API
    pub legacy_scan: bool,
    /// BR/EDR inquiry
    pub classic_scan: bool,
    /// PHY read / preference supported
    pub phy: bool,
    /// Largest MTU the stack will accept
    pub max_mtu: u16,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            le_scan: true,
            legacy_scan: true,
            classic_scan: false,
            phy: false,
            max_mtu: 517,
        }
    }
}

/// Pairing state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BondState::None => write!(f, "none"),
            BondState::Bonding => write!(f, "bonding"),
            BondState::Bonded => write!(f, "bonded"),
        }
    }
}

/// Unsolicited events for one open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer or the stack dropped the link
    Disconnected { status: Option<u8> },
    /// Notification or indication payload
    CharacteristicChanged {
        target: CharacteristicRef,
        value: Vec<u8>,
    },
}

/// Platform radio stack as seen by the connection layer.
///
/// Every call addresses one peer. A link's unsolicited events are pushed
/// into the sender handed to [`Transport::open_link`]; a new sender is
/// supplied on every open so events from an earlier link are never mixed
/// with the current one.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn capabilities(&self) -> TransportCapabilities;

    /// Open a link. Resolves once the low-level link is up.
    async fn open_link(
        &self,
        address: &Address,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(), TransportError>;

    async fn discover_services(
        &self,
        address: &Address,
    ) -> Result<Vec<GattService>, TransportError>;

    /// Submit one write chunk. Submission order is delivery order; the
    /// returned future resolves when the peer acknowledges the chunk.
    fn write_characteristic(
        &self,
        address: &Address,
        target: &CharacteristicRef,
        chunk: &[u8],
        write_type: WriteType,
    ) -> Result<PendingAck, TransportError>;

    async fn read_characteristic(
        &self,
        address: &Address,
        target: &CharacteristicRef,
    ) -> Result<Vec<u8>, TransportError>;

    async fn read_descriptor(
        &self,
        address: &Address,
        target: &DescriptorRef,
    ) -> Result<Vec<u8>, TransportError>;

    /// Enable or disable notifications (or indications) on a characteristic
    async fn set_notification(
        &self,
        address: &Address,
        target: &CharacteristicRef,
        enabled: bool,
        indication: bool,
    ) -> Result<(), TransportError>;

    /// Negotiate the MTU; resolves with the value the peer agreed to
    async fn request_mtu(&self, address: &Address, mtu: u16) -> Result<u16, TransportError>;

    async fn read_rssi(&self, address: &Address) -> Result<i16, TransportError>;

    async fn read_phy(&self, _address: &Address) -> Result<Phy, TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn set_preferred_phy(
        &self,
        _address: &Address,
        _phy: Phy,
        _options: u8,
    ) -> Result<Phy, TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Drop the link, if any. Does not emit [`LinkEvent::Disconnected`].
    async fn close_link(&self, address: &Address);

    fn bond_state(&self, address: &Address) -> BondState;

    /// Start pairing; completion is observed through [`Transport::bond_state`]
    fn create_bond(&self, address: &Address) -> Result<(), TransportError>;

    fn remove_bond(&self, address: &Address) -> Result<(), TransportError>;

    /// Ask the stack to switch the adapter on or off. The resulting state
    /// change is reported back through the registry.
    fn set_adapter_enabled(&self, enabled: bool) -> Result<(), TransportError>;

    fn start_scan(&self, kind: ScannerKind) -> Result<(), TransportError>;

    fn stop_scan(&self, kind: ScannerKind);
}

//! In-memory radio stack.
//!
//! Stands in for the platform driver in tests and in the CLI demo. Peers are
//! registered up front with their service tables; the simulation records
//! every write chunk with its submission instant and tracks how many
//! operations are outstanding per peer so serialization can be asserted.

use super::{
    BondState, CharacteristicRef, DescriptorRef, GattService, LinkEvent, PendingAck, Phy,
    Transport, TransportCapabilities,
};
use crate::config::WriteType;
use crate::device::Address;
use crate::error::TransportError;
use crate::scanner::ScannerKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// One write chunk as seen by the simulated peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub target: CharacteristicRef,
    pub data: Vec<u8>,
    pub write_type: WriteType,
    pub at: Instant,
}

#[derive(Debug)]
struct SimPeer {
    services: Vec<GattService>,
    values: HashMap<CharacteristicRef, Vec<u8>>,
    descriptor_values: HashMap<DescriptorRef, Vec<u8>>,
    notifying: HashSet<CharacteristicRef>,
    rssi: i16,
    bond: BondState,
    bond_requests: u32,
    reachable: bool,
    unresponsive: bool,
    connect_failures: u32,
    fail_writes: bool,
    max_mtu: u16,
    link: Option<mpsc::UnboundedSender<LinkEvent>>,
    opens: u32,
    writes: Vec<WriteRecord>,
    in_flight: usize,
    max_in_flight: usize,
}

impl SimPeer {
    fn new(services: Vec<GattService>) -> Self {
        Self {
            services,
            values: HashMap::new(),
            descriptor_values: HashMap::new(),
            notifying: HashSet::new(),
            rssi: -60,
            bond: BondState::None,
            bond_requests: 0,
            reachable: true,
            unresponsive: false,
            connect_failures: 0,
            fail_writes: false,
            max_mtu: 517,
            link: None,
            opens: 0,
            writes: Vec::new(),
            in_flight: 0,
            max_in_flight: 0,
        }
    }
}

#[derive(Debug)]
struct SimState {
    peers: HashMap<Address, SimPeer>,
    capabilities: TransportCapabilities,
    adapter_enabled: bool,
    scanning: HashSet<ScannerKind>,
    latency: Duration,
    ack_delay: Duration,
}

/// Counts one outstanding operation against a peer for as long as it lives
struct OpGuard {
    state: Arc<Mutex<SimState>>,
    address: Address,
}

impl OpGuard {
    fn enter(state: &Arc<Mutex<SimState>>, address: &Address) -> Self {
        if let Some(peer) = state.lock().peers.get_mut(address) {
            peer.in_flight += 1;
            peer.max_in_flight = peer.max_in_flight.max(peer.in_flight);
        }
        Self {
            state: Arc::clone(state),
            address: address.clone(),
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Some(peer) = self.state.lock().peers.get_mut(&self.address) {
            peer.in_flight = peer.in_flight.saturating_sub(1);
        }
    }
}

/// Simulated transport. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                peers: HashMap::new(),
                capabilities: TransportCapabilities::default(),
                adapter_enabled: true,
                scanning: HashSet::new(),
                latency: Duration::from_millis(5),
                ack_delay: Duration::from_millis(2),
            })),
        }
    }

    /// Delay applied to every link-level operation
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Delay between chunk submission and its acknowledgment
    pub fn with_ack_delay(self, delay: Duration) -> Self {
        self.state.lock().ack_delay = delay;
        self
    }

    pub fn with_capabilities(self, capabilities: TransportCapabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    /// Register a peer with its service table
    pub fn add_peer(&self, address: impl Into<Address>, services: Vec<GattService>) {
        self.state
            .lock()
            .peers
            .insert(address.into(), SimPeer::new(services));
    }

    fn with_peer<R>(&self, address: &Address, f: impl FnOnce(&mut SimPeer) -> R) -> Option<R> {
        self.state.lock().peers.get_mut(address).map(f)
    }

    /// Unreachable peers reject link opens
    pub fn set_reachable(&self, address: &Address, reachable: bool) {
        self.with_peer(address, |p| p.reachable = reachable);
    }

    /// Unresponsive peers never answer; operations hang until cancelled
    pub fn set_unresponsive(&self, address: &Address, unresponsive: bool) {
        self.with_peer(address, |p| p.unresponsive = unresponsive);
    }

    /// Fail the next `count` link opens with GATT status 133
    pub fn fail_next_connects(&self, address: &Address, count: u32) {
        self.with_peer(address, |p| p.connect_failures = count);
    }

    pub fn set_fail_writes(&self, address: &Address, fail: bool) {
        self.with_peer(address, |p| p.fail_writes = fail);
    }

    pub fn set_value(&self, address: &Address, target: CharacteristicRef, value: Vec<u8>) {
        self.with_peer(address, |p| {
            p.values.insert(target, value);
        });
    }

    pub fn set_descriptor_value(&self, address: &Address, target: DescriptorRef, value: Vec<u8>) {
        self.with_peer(address, |p| {
            p.descriptor_values.insert(target, value);
        });
    }

    pub fn set_rssi(&self, address: &Address, rssi: i16) {
        self.with_peer(address, |p| p.rssi = rssi);
    }

    pub fn set_max_mtu(&self, address: &Address, mtu: u16) {
        self.with_peer(address, |p| p.max_mtu = mtu);
    }

    pub fn set_bond_state(&self, address: &Address, bond: BondState) {
        self.with_peer(address, |p| p.bond = bond);
    }

    /// Drop the link from the peer side. Returns false when no link was open.
    pub fn drop_link(&self, address: &Address) -> bool {
        let link = self.with_peer(address, |p| p.link.take()).flatten();
        match link {
            Some(tx) => {
                debug!("sim: dropping link {}", address);
                let _ = tx.send(LinkEvent::Disconnected { status: Some(8) });
                true
            }
            None => false,
        }
    }

    /// Push a notification payload. Returns false when no link was open.
    pub fn push_notification(
        &self,
        address: &Address,
        target: CharacteristicRef,
        value: Vec<u8>,
    ) -> bool {
        let link = self.with_peer(address, |p| p.link.clone()).flatten();
        match link {
            Some(tx) => tx
                .send(LinkEvent::CharacteristicChanged { target, value })
                .is_ok(),
            None => false,
        }
    }

    pub fn writes(&self, address: &Address) -> Vec<WriteRecord> {
        self.with_peer(address, |p| p.writes.clone())
            .unwrap_or_default()
    }

    pub fn open_count(&self, address: &Address) -> u32 {
        self.with_peer(address, |p| p.opens).unwrap_or(0)
    }

    /// Highest number of operations ever outstanding at once for a peer
    pub fn max_concurrent_ops(&self, address: &Address) -> usize {
        self.with_peer(address, |p| p.max_in_flight).unwrap_or(0)
    }

    pub fn is_link_open(&self, address: &Address) -> bool {
        self.with_peer(address, |p| p.link.is_some())
            .unwrap_or(false)
    }

    pub fn is_notifying(&self, address: &Address, target: &CharacteristicRef) -> bool {
        self.with_peer(address, |p| p.notifying.contains(target))
            .unwrap_or(false)
    }

    pub fn bond_requests(&self, address: &Address) -> u32 {
        self.with_peer(address, |p| p.bond_requests).unwrap_or(0)
    }

    pub fn adapter_enabled(&self) -> bool {
        self.state.lock().adapter_enabled
    }

    pub fn is_scanning(&self, kind: ScannerKind) -> bool {
        self.state.lock().scanning.contains(&kind)
    }

    async fn settle(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Resolve the peer for a link-level operation
    fn linked_peer(&self, address: &Address) -> Result<bool, TransportError> {
        let state = self.state.lock();
        if !state.adapter_enabled {
            return Err(TransportError::AdapterDisabled);
        }
        let peer = state
            .peers
            .get(address)
            .ok_or_else(|| TransportError::Rejected(format!("unknown peer {}", address)))?;
        if peer.link.is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(peer.unresponsive)
    }

    async fn hang_if(unresponsive: bool) {
        if unresponsive {
            futures::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.state.lock().capabilities.clone()
    }

    async fn open_link(
        &self,
        address: &Address,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(), TransportError> {
        self.settle().await;
        let unresponsive = {
            let mut state = self.state.lock();
            if !state.adapter_enabled {
                return Err(TransportError::AdapterDisabled);
            }
            let peer = state
                .peers
                .get_mut(address)
                .ok_or_else(|| TransportError::Rejected(format!("unknown peer {}", address)))?;
            if peer.unresponsive {
                true
            } else {
                if peer.connect_failures > 0 {
                    peer.connect_failures -= 1;
                    return Err(TransportError::GattStatus(133));
                }
                if !peer.reachable {
                    return Err(TransportError::Rejected("peer unreachable".to_string()));
                }
                peer.link = Some(events);
                peer.opens += 1;
                false
            }
        };
        Self::hang_if(unresponsive).await;
        trace!("sim: link open {}", address);
        Ok(())
    }

    async fn discover_services(
        &self,
        address: &Address,
    ) -> Result<Vec<GattService>, TransportError> {
        self.settle().await;
        let unresponsive = self.linked_peer(address)?;
        Self::hang_if(unresponsive).await;
        Ok(self
            .with_peer(address, |p| p.services.clone())
            .unwrap_or_default())
    }

    fn write_characteristic(
        &self,
        address: &Address,
        target: &CharacteristicRef,
        chunk: &[u8],
        write_type: WriteType,
    ) -> Result<PendingAck, TransportError> {
        let unresponsive = self.linked_peer(address)?;
        let ack_delay = {
            let mut state = self.state.lock();
            let ack_delay = state.ack_delay;
            if let Some(peer) = state.peers.get_mut(address) {
                if peer.fail_writes {
                    return Err(TransportError::GattStatus(3));
                }
                peer.writes.push(WriteRecord {
                    target: *target,
                    data: chunk.to_vec(),
                    write_type,
                    at: Instant::now(),
                });
            }
            ack_delay
        };
        let guard = OpGuard::enter(&self.state, address);
        Ok(Box::pin(async move {
            let _guard = guard;
            if !ack_delay.is_zero() {
                tokio::time::sleep(ack_delay).await;
            }
            Self::hang_if(unresponsive).await;
            Ok(())
        }))
    }

    async fn read_characteristic(
        &self,
        address: &Address,
        target: &CharacteristicRef,
    ) -> Result<Vec<u8>, TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        self.settle().await;
        let unresponsive = self.linked_peer(address)?;
        Self::hang_if(unresponsive).await;
        Ok(self
            .with_peer(address, |p| p.values.get(target).cloned())
            .flatten()
            .unwrap_or_default())
    }

    async fn read_descriptor(
        &self,
        address: &Address,
        target: &DescriptorRef,
    ) -> Result<Vec<u8>, TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        self.settle().await;
        let unresponsive = self.linked_peer(address)?;
        Self::hang_if(unresponsive).await;
        Ok(self
            .with_peer(address, |p| p.descriptor_values.get(target).cloned())
            .flatten()
            .unwrap_or_default())
    }

    async fn set_notification(
        &self,
        address: &Address,
        target: &CharacteristicRef,
        enabled: bool,
        _indication: bool,
    ) -> Result<(), TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        self.settle().await;
        let unresponsive = self.linked_peer(address)?;
        Self::hang_if(unresponsive).await;
        self.with_peer(address, |p| {
            if enabled {
                p.notifying.insert(*target);
            } else {
                p.notifying.remove(target);
            }
        });
        Ok(())
    }

    async fn request_mtu(&self, address: &Address, mtu: u16) -> Result<u16, TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        self.settle().await;
        let unresponsive = self.linked_peer(address)?;
        Self::hang_if(unresponsive).await;
        let stack_max = self.state.lock().capabilities.max_mtu;
        let peer_max = self.with_peer(address, |p| p.max_mtu).unwrap_or(stack_max);
        Ok(mtu.min(stack_max).min(peer_max))
    }

    async fn read_rssi(&self, address: &Address) -> Result<i16, TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        self.settle().await;
        let unresponsive = self.linked_peer(address)?;
        Self::hang_if(unresponsive).await;
        Ok(self.with_peer(address, |p| p.rssi).unwrap_or(-127))
    }

    async fn read_phy(&self, address: &Address) -> Result<Phy, TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        if !self.state.lock().capabilities.phy {
            return Err(TransportError::Unsupported);
        }
        self.settle().await;
        self.linked_peer(address)?;
        Ok(Phy::default())
    }

    async fn set_preferred_phy(
        &self,
        address: &Address,
        phy: Phy,
        _options: u8,
    ) -> Result<Phy, TransportError> {
        let _guard = OpGuard::enter(&self.state, address);
        if !self.state.lock().capabilities.phy {
            return Err(TransportError::Unsupported);
        }
        self.settle().await;
        self.linked_peer(address)?;
        Ok(phy)
    }

    async fn close_link(&self, address: &Address) {
        if self.with_peer(address, |p| p.link.take()).flatten().is_some() {
            trace!("sim: link closed {}", address);
        }
    }

    fn bond_state(&self, address: &Address) -> BondState {
        self.with_peer(address, |p| p.bond).unwrap_or(BondState::None)
    }

    fn create_bond(&self, address: &Address) -> Result<(), TransportError> {
        self.with_peer(address, |p| {
            p.bond_requests += 1;
            p.bond = BondState::Bonded;
        })
        .ok_or_else(|| TransportError::Rejected(format!("unknown peer {}", address)))
    }

    fn remove_bond(&self, address: &Address) -> Result<(), TransportError> {
        self.with_peer(address, |p| p.bond = BondState::None)
            .ok_or_else(|| TransportError::Rejected(format!("unknown peer {}", address)))
    }

    fn set_adapter_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.adapter_enabled = enabled;
        if !enabled {
            state.scanning.clear();
            for peer in state.peers.values_mut() {
                peer.link = None;
            }
        }
        debug!("sim: adapter {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    fn start_scan(&self, kind: ScannerKind) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.adapter_enabled {
            return Err(TransportError::AdapterDisabled);
        }
        state.scanning.insert(kind);
        Ok(())
    }

    fn stop_scan(&self, kind: ScannerKind) {
        self.state.lock().scanning.remove(&kind);
    }
}

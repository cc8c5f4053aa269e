/// Connection registry
///
/// One table of live connections keyed by device address, plus the
/// insertion order for first/last/ordered queries. The registry owns the
/// radio adapter, decides when to pair before connecting, fans adapter
/// transitions out to every connection and publishes on the shared bus.

use crate::bus::{EventBus, ThreadMode};
use crate::config::ConnectionConfiguration;
use crate::connection::{self, ConnectionHandle, ConnectionId, ConnectionSetup, ReleaseHook};
use crate::device::{Address, ConnectionState, Device};
use crate::error::{RegistryError, RequestError, TransportError};
use crate::event::{ConnectFailure, Event, EventObserver};
use crate::request::RequestDescriptor;
use crate::scanner::{ScanCoordinator, ScannerKind};
use crate::transport::{BondState, Transport, TransportCapabilities};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Settle time between starting a bond and the first connect attempt
pub const DEFAULT_BOND_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Decides whether a device must be bonded before connecting
#[cfg_attr(test, mockall::automock)]
pub trait BondController: Send + Sync {
    fn accept(&self, device: &Device) -> bool;
}

/// Builds a device for connect-by-address; `None` rejects the address
#[cfg_attr(test, mockall::automock)]
pub trait DeviceCreator: Send + Sync {
    fn create(&self, address: &Address) -> Option<Device>;
}

/// Exclusive handle on the platform radio. Not `Clone`: a registry takes it
/// by value, so one adapter drives at most one registry.
pub struct RadioAdapter {
    transport: Arc<dyn Transport>,
}

impl RadioAdapter {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn capabilities(&self) -> TransportCapabilities {
        self.transport.capabilities()
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[derive(Default)]
struct Table {
    map: HashMap<Address, ConnectionHandle>,
    order: Vec<Address>,
}

impl Table {
    fn remove(&mut self, address: &Address) -> Option<ConnectionHandle> {
        let handle = self.map.remove(address)?;
        self.order.retain(|a| a != address);
        Some(handle)
    }
}

/// Process-level entry point for connections
pub struct Registry {
    adapter: RadioAdapter,
    table: Arc<RwLock<Table>>,
    bus: EventBus,
    bond_controller: Option<Arc<dyn BondController>>,
    device_creator: Option<Arc<dyn DeviceCreator>>,
    scans: Arc<ScanCoordinator>,
    /// Released connections whose link may still be closing
    departing: Mutex<HashMap<Address, oneshot::Receiver<()>>>,
    /// Addresses last seen advertising as not connectable
    unconnectable: Mutex<HashSet<Address>>,
    bond_settle_delay: Duration,
    default_config: ConnectionConfiguration,
    adapter_enabled: AtomicBool,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(adapter: RadioAdapter) -> Self {
        let scans = Arc::new(ScanCoordinator::new(Arc::clone(adapter.transport()), None));
        Self {
            adapter,
            table: Arc::new(RwLock::new(Table::default())),
            bus: EventBus::new(),
            bond_controller: None,
            device_creator: None,
            scans,
            departing: Mutex::new(HashMap::new()),
            unconnectable: Mutex::new(HashSet::new()),
            bond_settle_delay: DEFAULT_BOND_SETTLE_DELAY,
            default_config: ConnectionConfiguration::default(),
            adapter_enabled: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_bond_controller(mut self, controller: Arc<dyn BondController>) -> Self {
        self.bond_controller = Some(controller);
        self
    }

    pub fn with_device_creator(mut self, creator: Arc<dyn DeviceCreator>) -> Self {
        self.device_creator = Some(creator);
        self
    }

    pub fn with_scanner_preference(mut self, kind: ScannerKind) -> Self {
        self.scans = Arc::new(ScanCoordinator::new(
            Arc::clone(self.adapter.transport()),
            Some(kind),
        ));
        self
    }

    pub fn with_bond_settle_delay(mut self, delay: Duration) -> Self {
        self.bond_settle_delay = delay;
        self
    }

    /// Configuration used when `connect` is given none
    pub fn with_default_configuration(mut self, config: ConnectionConfiguration) -> Self {
        self.default_config = config;
        self
    }

    /// Initial adapter state when the platform reports it at startup
    pub fn with_adapter_enabled(self, enabled: bool) -> Self {
        self.adapter_enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_adapter_enabled(&self) -> bool {
        self.adapter_enabled.load(Ordering::SeqCst)
    }

    // ----- connections -----

    /// Connect to a device. Any existing connection for the same address is
    /// released without a terminal event first, and the new link is not
    /// opened until the old one is closed. Must be called inside a tokio
    /// runtime.
    pub fn connect(
        &self,
        device: impl Into<Arc<Device>>,
        config: Option<ConnectionConfiguration>,
        observer: Option<Arc<dyn EventObserver>>,
    ) -> Result<ConnectionHandle, RegistryError> {
        let device: Arc<Device> = device.into();
        let address = device.address().clone();

        if !device.is_connectable() {
            warn!("{} is not connectable", device);
            self.unconnectable.lock().insert(address.clone());
            let event = Event::ConnectFailed {
                device: Arc::clone(&device),
                failure: ConnectFailure::Unconnectable,
            };
            if let Some(observer) = &observer {
                event.dispatch(observer.as_ref());
            }
            self.bus.notify(&event);
            return Err(RegistryError::UnconnectableDevice(address.to_string()));
        }

        self.unconnectable.lock().remove(&address);

        let start_delay = self.bond_if_needed(&device);
        let transport = Arc::clone(self.adapter.transport());

        let mut table = self.table.write();
        let predecessor = match table.remove(&address) {
            Some(previous) => {
                debug!("replacing {} for {}", previous.id(), address);
                Some(previous.release_then(false))
            }
            None => self.departing.lock().remove(&address),
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = connection::spawn(ConnectionSetup {
            id,
            device: Arc::clone(&device),
            config: config.unwrap_or_else(|| self.default_config.clone()),
            transport,
            observer,
            bus: self.bus.clone(),
            scans: Arc::clone(&self.scans),
            on_release: Some(self.release_hook()),
            predecessor,
            start_delay,
            adapter_enabled: self.is_adapter_enabled(),
        });
        table.map.insert(address.clone(), handle.clone());
        table.order.push(address);
        info!("connection {} created for {}", id, device);
        Ok(handle)
    }

    /// Connect by address, building the device through the device creator
    pub fn connect_address(
        &self,
        address: impl Into<Address>,
        config: Option<ConnectionConfiguration>,
        observer: Option<Arc<dyn EventObserver>>,
    ) -> Result<ConnectionHandle, RegistryError> {
        let address = address.into();
        let device = match &self.device_creator {
            Some(creator) => creator
                .create(&address)
                .ok_or_else(|| RegistryError::DeviceRejected(address.to_string()))?,
            None => Device::new(address),
        };
        self.connect(device, config, observer)
    }

    /// Start pairing when the controller asks for it; returns the settle delay
    fn bond_if_needed(&self, device: &Device) -> Option<Duration> {
        let controller = self.bond_controller.as_ref()?;
        if !controller.accept(device) {
            return None;
        }
        let transport = self.adapter.transport();
        if transport.bond_state(device.address()) != BondState::None {
            return None;
        }
        match transport.create_bond(device.address()) {
            Ok(()) => {
                info!("bonding {} before connecting", device);
                Some(self.bond_settle_delay)
            }
            Err(e) => {
                warn!("bond request for {} failed: {}", device, e);
                None
            }
        }
    }

    /// Removes the table entry only if it still belongs to the releasing
    /// connection
    fn release_hook(&self) -> ReleaseHook {
        let table: Weak<RwLock<Table>> = Arc::downgrade(&self.table);
        Box::new(move |id: ConnectionId, address: &Address| {
            let Some(table) = table.upgrade() else {
                return;
            };
            let mut table = table.write();
            if table.map.get(address).map(|h| h.id()) == Some(id) {
                table.remove(address);
                debug!("{} removed from registry", id);
            }
        })
    }

    fn handle(&self, address: &Address) -> Result<ConnectionHandle, RegistryError> {
        self.table
            .read()
            .map
            .get(address)
            .cloned()
            .ok_or_else(|| RegistryError::ConnectionNotFound(address.to_string()))
    }

    pub fn disconnect(&self, address: &Address) -> Result<(), RegistryError> {
        self.handle(address)?.disconnect();
        Ok(())
    }

    /// Reconnect unless services are already discovered
    pub fn reconnect(&self, address: &Address) -> Result<(), RegistryError> {
        let handle = self.handle(address)?;
        if handle.state() != ConnectionState::ServiceDiscovered {
            handle.reconnect();
        }
        Ok(())
    }

    pub fn reconnect_all(&self) {
        for handle in self.connections() {
            if handle.state() != ConnectionState::ServiceDiscovered {
                handle.reconnect();
            }
        }
    }

    /// Release and forget the connection for an address
    pub fn release(&self, address: &Address) -> Result<(), RegistryError> {
        let handle = self
            .table
            .write()
            .remove(address)
            .ok_or_else(|| RegistryError::ConnectionNotFound(address.to_string()))?;
        self.depart(&handle, true);
        Ok(())
    }

    /// Release a connection already taken out of the table. A later
    /// `connect` for the same address waits for its link to close.
    fn depart(&self, handle: &ConnectionHandle, notify: bool) {
        let closed = handle.release_then(notify);
        self.departing.lock().insert(handle.address().clone(), closed);
    }

    pub fn disconnect_all(&self) {
        for handle in self.connections() {
            handle.disconnect();
        }
    }

    pub fn release_all(&self) {
        let handles: Vec<ConnectionHandle> = {
            let mut table = self.table.write();
            table.order.clear();
            table.map.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            self.depart(&handle, true);
        }
    }

    /// Queue a request on the connection for `address`. Without a
    /// connection the request's callback fires with `Disconnected`, or with
    /// `UnconnectableDevice` when the address was refused as unconnectable.
    pub fn execute(
        &self,
        address: &Address,
        request: RequestDescriptor,
    ) -> Result<(), RegistryError> {
        match self.handle(address) {
            Ok(handle) => {
                handle.execute(request);
                Ok(())
            }
            Err(e) => {
                if self.unconnectable.lock().contains(address) {
                    request.complete(Err(RequestError::UnconnectableDevice));
                    return Err(RegistryError::UnconnectableDevice(address.to_string()));
                }
                request.complete(Err(RequestError::Disconnected));
                Err(e)
            }
        }
    }

    pub fn connection(&self, address: &Address) -> Option<ConnectionHandle> {
        self.table.read().map.get(address).cloned()
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.table.read().map.values().cloned().collect()
    }

    /// Connections in the order they were created
    pub fn ordered_connections(&self) -> Vec<ConnectionHandle> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|a| table.map.get(a).cloned())
            .collect()
    }

    pub fn first_connection(&self) -> Option<ConnectionHandle> {
        let table = self.table.read();
        table.order.first().and_then(|a| table.map.get(a).cloned())
    }

    pub fn last_connection(&self) -> Option<ConnectionHandle> {
        let table = self.table.read();
        table.order.last().and_then(|a| table.map.get(a).cloned())
    }

    // ----- observers -----

    pub fn register_observer(
        &self,
        observer: Arc<dyn EventObserver>,
        mode: ThreadMode,
        tag: Option<String>,
    ) -> bool {
        self.bus.register(observer, mode, tag)
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn EventObserver>) -> bool {
        self.bus.unregister(observer)
    }

    pub fn is_observer_registered(&self, observer: &Arc<dyn EventObserver>) -> bool {
        self.bus.is_registered(observer)
    }

    // ----- scanning -----

    /// True while the application or a connection waiting to reconnect
    /// keeps the scanner running
    pub fn is_scanning(&self) -> bool {
        self.scans.is_scanning()
    }

    pub fn scanner_kind(&self) -> Option<ScannerKind> {
        self.scans.current().map(|s| s.kind())
    }

    pub fn start_scan(&self) -> Result<(), RegistryError> {
        if !self.is_adapter_enabled() {
            return Err(RegistryError::Transport(TransportError::AdapterDisabled));
        }
        self.scans.start_requested()?;
        Ok(())
    }

    /// Stop scanning unless a connection is still waiting to reconnect
    pub fn stop_scan(&self) {
        self.scans.stop_requested();
    }

    /// Feed a scan result from the platform backend
    pub fn on_device_discovered(&self, device: Device) {
        {
            let mut unconnectable = self.unconnectable.lock();
            if device.is_connectable() {
                unconnectable.remove(device.address());
            } else {
                unconnectable.insert(device.address().clone());
            }
        }
        let existing = self.connection(device.address());
        let device = match &existing {
            Some(handle) => {
                let known = handle.device();
                if !device.name().is_empty() {
                    known.set_name(device.name());
                }
                known.set_rssi(device.rssi());
                Arc::clone(known)
            }
            None => Arc::new(device),
        };
        self.bus.notify(&Event::DeviceDiscovered { device });
        if let Some(handle) = existing {
            handle.device_discovered();
        }
    }

    // ----- adapter -----

    pub fn enable_adapter(&self) -> Result<(), RegistryError> {
        self.adapter.transport().set_adapter_enabled(true)?;
        Ok(())
    }

    pub fn disable_adapter(&self) -> Result<(), RegistryError> {
        self.adapter.transport().set_adapter_enabled(false)?;
        Ok(())
    }

    /// Platform report of an adapter transition. Returns once every
    /// connection has applied it: after an `off` report all of them are
    /// disconnected.
    pub async fn on_adapter_state_changed(&self, enabled: bool) {
        if self.adapter_enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        info!("adapter {}", if enabled { "on" } else { "off" });
        if !enabled {
            self.scans.on_adapter_off();
        }
        self.bus.notify(&Event::AdapterStateChanged { enabled });
        for handle in self.connections() {
            handle.set_adapter_state(enabled).await;
        }
    }

    // ----- bonding -----

    pub fn bond_state(&self, address: &Address) -> BondState {
        self.adapter.transport().bond_state(address)
    }

    pub fn create_bond(&self, address: &Address) -> Result<(), RegistryError> {
        self.adapter.transport().create_bond(address)?;
        Ok(())
    }

    pub fn remove_bond(&self, address: &Address) -> Result<(), RegistryError> {
        self.adapter.transport().remove_bond(address)?;
        Ok(())
    }

    /// Stop scanning, release every connection and drop all observers
    pub fn shutdown(&self) {
        info!("registry shutting down");
        self.scans.stop_all();
        self.release_all();
        self.bus.unregister_all();
    }
}

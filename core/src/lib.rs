// Gattlane Core: BLE connection and request orchestration
//
// One task per device link. Requests are serialized per link, ordered by
// priority, and every outcome is reported exactly once.

pub mod bus;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod event;
pub mod registry;
pub mod request;
pub mod scanner;
pub mod transport;

pub use bus::{EventBus, ThreadMode};
pub use config::{
    BackoffSchedule, BackoffStep, BringUpPolicy, ConnectionConfiguration, FrameValidator,
    MtuPolicy, WriteOptions, WriteType, DEFAULT_MTU, TRY_RECONNECT_TIMES_INFINITE,
};
pub use connection::{ConnectionHandle, ConnectionId};
pub use device::{Address, ConnectionState, Device};
pub use error::{RegistryError, RequestError, TransportError};
pub use event::{ConnectFailure, ConnectTimeoutKind, Event, EventObserver};
pub use registry::{BondController, DeviceCreator, RadioAdapter, Registry};
pub use request::{
    Operation, RequestCallback, RequestDescriptor, RequestId, RequestInfo, RequestKind,
    RequestResult, RequestValue,
};
pub use scanner::{Scanner, ScannerKind};
pub use transport::{
    BondState, CharacteristicProperty, CharacteristicRef, DescriptorRef, GattCharacteristic,
    GattService, LinkEvent, Phy, SimulatedTransport, Transport, TransportCapabilities,
};

//! One device link: state machine, request executor and reconnection policy.
//!
//! Each connection runs as its own tokio task. [`ConnectionHandle`] is the
//! only way in: every method posts a command to that task, so callers on
//! any thread never observe a half-applied state change.

mod actor;
mod write;

pub(crate) use actor::{spawn, ConnectionSetup, ReleaseHook};

use crate::device::{Address, ConnectionState, Device};
use crate::error::RequestError;
use crate::request::{RequestDescriptor, RequestKind, RequestResult};
use crate::transport::{
    find_characteristic, CharacteristicProperty, CharacteristicRef, GattService,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Identifies one connection instance; a replacement for the same address
/// gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Commands accepted by the connection task
pub(crate) enum Command {
    Execute(RequestDescriptor),
    Disconnect,
    Reconnect,
    Refresh,
    Release {
        notify: bool,
        reply: Option<oneshot::Sender<()>>,
    },
    AdapterState {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    DeviceDiscovered,
    ClearQueue {
        kind: Option<RequestKind>,
    },
}

/// State readable without a round trip to the connection task
pub(crate) struct Shared {
    pub(crate) device: Arc<Device>,
    pub(crate) mtu: RwLock<u16>,
    pub(crate) services: RwLock<Vec<GattService>>,
    pub(crate) auto_reconnect: bool,
    pub(crate) released: AtomicBool,
}

/// Cloneable handle to a running connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            shared,
            commands,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    pub fn address(&self) -> &Address {
        self.shared.device.address()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_released() {
            ConnectionState::Released
        } else {
            self.shared.device.connection_state()
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn is_auto_reconnect_enabled(&self) -> bool {
        self.shared.auto_reconnect
    }

    /// Negotiated MTU of the current link (23 until negotiated)
    pub fn mtu(&self) -> u16 {
        *self.shared.mtu.read()
    }

    /// Services found by the last successful discovery
    pub fn services(&self) -> Vec<GattService> {
        self.shared.services.read().clone()
    }

    pub fn has_property(
        &self,
        service: Uuid,
        characteristic: Uuid,
        property: CharacteristicProperty,
    ) -> bool {
        let services = self.shared.services.read();
        find_characteristic(&services, &CharacteristicRef::new(service, characteristic))
            .map(|c| c.has_property(property))
            .unwrap_or(false)
    }

    /// Queue a request. Its callback and events report the outcome.
    pub fn execute(&self, request: RequestDescriptor) {
        if self.is_released() {
            request.complete(Err(RequestError::Cancelled));
            return;
        }
        if let Err(mpsc::error::SendError(Command::Execute(request))) =
            self.commands.send(Command::Execute(request))
        {
            request.complete(Err(RequestError::Cancelled));
        }
    }

    /// Queue a request and get its outcome through a channel
    pub fn submit(&self, mut request: RequestDescriptor) -> oneshot::Receiver<RequestResult> {
        let (tx, rx) = oneshot::channel();
        request.chain_callback(move |result| {
            let _ = tx.send(result);
        });
        self.execute(request);
        rx
    }

    /// Drop the link and stay disconnected. Pending requests fail.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Start a fresh connect attempt unless services are already discovered
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Drop and re-establish the link, keeping queued requests
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Release with a final `Released` state event
    pub fn release(&self) {
        let _ = self.commands.send(Command::Release {
            notify: true,
            reply: None,
        });
    }

    /// Release without the terminal state event
    pub fn release_no_event(&self) {
        let _ = self.commands.send(Command::Release {
            notify: false,
            reply: None,
        });
    }

    /// Release and wait until the connection task has finished
    pub async fn release_and_wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Release {
                notify: true,
                reply: Some(tx),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Release and hand back a receiver that resolves once the task has
    /// stopped and its link is closed. Resolves at once if the task is gone.
    pub(crate) fn release_then(&self, notify: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Release {
            notify,
            reply: Some(tx),
        });
        rx
    }

    /// Cancel every queued request
    pub fn clear_request_queue(&self) {
        let _ = self.commands.send(Command::ClearQueue { kind: None });
    }

    /// Cancel queued requests of one kind
    pub fn clear_request_queue_by_kind(&self, kind: RequestKind) {
        let _ = self.commands.send(Command::ClearQueue { kind: Some(kind) });
    }

    pub(crate) async fn set_adapter_state(&self, enabled: bool) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::AdapterState { enabled, reply: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub(crate) fn device_discovered(&self) {
        let _ = self.commands.send(Command::DeviceDiscovered);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("address", self.address())
            .field("state", &self.state())
            .finish()
    }
}

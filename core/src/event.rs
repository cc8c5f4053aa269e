//! Events produced by connections and the registry, and the observer trait
//! they are delivered through.

use crate::device::{ConnectionState, Device};
use crate::error::RequestError;
use crate::request::{RequestInfo, RequestValue};
use crate::transport::CharacteristicRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which phase a connect attempt was stuck in when it timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectTimeoutKind {
    /// Link never came up
    CannotConnect,
    /// Link up but service discovery never finished
    CannotDiscoverServices,
    /// Never seen again while waiting to reconnect
    CannotDiscoverDevice,
}

/// Why a connection gave up without a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectFailure {
    /// The device advertises itself as not connectable
    Unconnectable,
    /// Reconnect attempts exhausted
    MaximumReconnection,
}

#[derive(Debug, Clone)]
pub enum Event {
    ConnectionStateChanged {
        device: Arc<Device>,
        state: ConnectionState,
    },
    ConnectFailed {
        device: Arc<Device>,
        failure: ConnectFailure,
    },
    ConnectTimeout {
        device: Arc<Device>,
        kind: ConnectTimeoutKind,
    },
    RequestCompleted {
        device: Arc<Device>,
        request: RequestInfo,
        value: RequestValue,
    },
    RequestFailed {
        device: Arc<Device>,
        request: RequestInfo,
        error: RequestError,
    },
    CharacteristicChanged {
        device: Arc<Device>,
        target: CharacteristicRef,
        value: Vec<u8>,
    },
    AdapterStateChanged {
        enabled: bool,
    },
    DeviceDiscovered {
        device: Arc<Device>,
    },
}

impl Event {
    /// Correlation tag of the request behind this event, if any
    pub fn tag(&self) -> Option<&str> {
        match self {
            Event::RequestCompleted { request, .. } | Event::RequestFailed { request, .. } => {
                request.tag.as_deref()
            }
            _ => None,
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        match self {
            Event::ConnectionStateChanged { device, .. }
            | Event::ConnectFailed { device, .. }
            | Event::ConnectTimeout { device, .. }
            | Event::RequestCompleted { device, .. }
            | Event::RequestFailed { device, .. }
            | Event::CharacteristicChanged { device, .. }
            | Event::DeviceDiscovered { device } => Some(device),
            Event::AdapterStateChanged { .. } => None,
        }
    }

    /// Route the event to the matching observer method
    pub fn dispatch(&self, observer: &dyn EventObserver) {
        match self {
            Event::ConnectionStateChanged { device, state } => {
                observer.on_connection_state_changed(device, *state)
            }
            Event::ConnectFailed { device, failure } => {
                observer.on_connect_failed(device, *failure)
            }
            Event::ConnectTimeout { device, kind } => observer.on_connect_timeout(device, *kind),
            Event::RequestCompleted {
                device,
                request,
                value,
            } => observer.on_request_completed(device, request, value),
            Event::RequestFailed {
                device,
                request,
                error,
            } => observer.on_request_failed(device, request, error),
            Event::CharacteristicChanged {
                device,
                target,
                value,
            } => observer.on_characteristic_changed(device, target, value),
            Event::AdapterStateChanged { enabled } => observer.on_adapter_state_changed(*enabled),
            Event::DeviceDiscovered { device } => observer.on_device_discovered(device),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ConnectionStateChanged { device, state } => {
                write!(f, "StateChanged {{ device: {}, state: {} }}", device.address(), state)
            }
            Event::ConnectFailed { device, failure } => {
                let address = device.address();
                write!(f, "ConnectFailed {{ device: {}, failure: {:?} }}", address, failure)
            }
            Event::ConnectTimeout { device, kind } => {
                write!(f, "ConnectTimeout {{ device: {}, kind: {:?} }}", device.address(), kind)
            }
            Event::RequestCompleted { device, request, .. } => write!(
                f,
                "RequestCompleted {{ device: {}, request: {} {} }}",
                device.address(),
                request.kind,
                request.id
            ),
            Event::RequestFailed {
                device,
                request,
                error,
            } => write!(
                f,
                "RequestFailed {{ device: {}, request: {} {}, error: {} }}",
                device.address(),
                request.kind,
                request.id,
                error
            ),
            Event::CharacteristicChanged {
                device,
                target,
                value,
            } => write!(
                f,
                "CharacteristicChanged {{ device: {}, target: {}, len: {} }}",
                device.address(),
                target,
                value.len()
            ),
            Event::AdapterStateChanged { enabled } => {
                write!(f, "AdapterStateChanged {{ enabled: {} }}", enabled)
            }
            Event::DeviceDiscovered { device } => {
                write!(f, "DeviceDiscovered {{ device: {} }}", device.address())
            }
        }
    }
}

/// Receives events. Every method defaults to a no-op so observers only
/// implement what they care about.
pub trait EventObserver: Send + Sync + 'static {
    fn on_connection_state_changed(&self, _device: &Arc<Device>, _state: ConnectionState) {}

    fn on_connect_failed(&self, _device: &Arc<Device>, _failure: ConnectFailure) {}

    fn on_connect_timeout(&self, _device: &Arc<Device>, _kind: ConnectTimeoutKind) {}

    fn on_request_completed(
        &self,
        _device: &Arc<Device>,
        _request: &RequestInfo,
        _value: &RequestValue,
    ) {
    }

    fn on_request_failed(
        &self,
        _device: &Arc<Device>,
        _request: &RequestInfo,
        _error: &RequestError,
    ) {
    }

    fn on_characteristic_changed(
        &self,
        _device: &Arc<Device>,
        _target: &CharacteristicRef,
        _value: &[u8],
    ) {
    }

    fn on_adapter_state_changed(&self, _enabled: bool) {}

    fn on_device_discovered(&self, _device: &Arc<Device>) {}
}

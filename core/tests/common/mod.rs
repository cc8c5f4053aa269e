// Shared fixtures for the integration suites

#![allow(dead_code)]

use gattlane_core::transport::uuid_from_u16;
use gattlane_core::{
    Address, CharacteristicProperty, CharacteristicRef, ConnectFailure, ConnectTimeoutKind,
    ConnectionState, DescriptorRef, Device, EventObserver, GattCharacteristic, GattService,
    RadioAdapter, Registry, RequestError, RequestInfo, RequestKind, RequestValue,
    SimulatedTransport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const ADDR_A: &str = "AA:00:00:00:00:01";
pub const ADDR_B: &str = "AA:00:00:00:00:02";
pub const ADDR_C: &str = "AA:00:00:00:00:03";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("gattlane_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn addr(s: &str) -> Address {
    Address::new(s)
}

pub fn data_char() -> CharacteristicRef {
    CharacteristicRef::new(uuid_from_u16(0xFFE0), uuid_from_u16(0xFFE1))
}

pub fn notify_char() -> CharacteristicRef {
    CharacteristicRef::new(uuid_from_u16(0xFFE0), uuid_from_u16(0xFFE2))
}

pub fn user_descriptor() -> DescriptorRef {
    DescriptorRef::new(
        uuid_from_u16(0xFFE0),
        uuid_from_u16(0xFFE1),
        uuid_from_u16(0x2901),
    )
}

/// One service with a writable data characteristic and a notify characteristic
pub fn services() -> Vec<GattService> {
    vec![GattService::new(uuid_from_u16(0xFFE0))
        .with_characteristic(
            GattCharacteristic::new(uuid_from_u16(0xFFE1))
                .with_property(CharacteristicProperty::Read)
                .with_property(CharacteristicProperty::Write)
                .with_descriptor(uuid_from_u16(0x2901)),
        )
        .with_characteristic(
            GattCharacteristic::new(uuid_from_u16(0xFFE2))
                .with_property(CharacteristicProperty::Notify),
        )]
}

/// Simulated radio with the given peers and a registry driving it
pub fn rig(peers: &[&str]) -> (SimulatedTransport, Registry) {
    let sim = SimulatedTransport::new();
    for peer in peers {
        sim.add_peer(*peer, services());
    }
    let registry = Registry::new(RadioAdapter::new(sim.clone()));
    (sim, registry)
}

pub fn observe(recorder: &Arc<Recorder>) -> Option<Arc<dyn EventObserver>> {
    Some(Arc::clone(recorder) as Arc<dyn EventObserver>)
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    State(ConnectionState),
    ConnectFailed(ConnectFailure),
    ConnectTimeout(ConnectTimeoutKind),
    Completed {
        kind: RequestKind,
        tag: Option<String>,
        value: RequestValue,
    },
    RequestFailed {
        kind: RequestKind,
        tag: Option<String>,
        error: RequestError,
    },
    Changed(CharacteristicRef, Vec<u8>),
    Adapter(bool),
    Discovered(Address),
}

/// Observer that keeps everything it sees, stamped with the (paused) clock
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<(Instant, Seen)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().push((Instant::now(), seen));
    }

    pub fn all(&self) -> Vec<Seen> {
        self.seen.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn timed_states(&self) -> Vec<(Instant, ConnectionState)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(at, s)| match s {
                Seen::State(state) => Some((*at, *state)),
                _ => None,
            })
            .collect()
    }

    pub fn count_state(&self, state: ConnectionState) -> usize {
        self.states().iter().filter(|s| **s == state).count()
    }

    pub fn connect_failures(&self) -> Vec<ConnectFailure> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::ConnectFailed(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    pub fn connect_timeouts(&self) -> Vec<ConnectTimeoutKind> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::ConnectTimeout(k) => Some(*k),
                _ => None,
            })
            .collect()
    }

    pub fn completed_kinds(&self) -> Vec<RequestKind> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::Completed { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn completed_tags(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::Completed { tag: Some(tag), .. } => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn request_failures(&self) -> Vec<RequestError> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::RequestFailed { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn request_events(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, Seen::Completed { .. } | Seen::RequestFailed { .. }))
            .count()
    }

    pub fn notifications(&self) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, s)| match s {
                Seen::Changed(_, value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

impl EventObserver for Recorder {
    fn on_connection_state_changed(&self, _device: &Arc<Device>, state: ConnectionState) {
        self.push(Seen::State(state));
    }

    fn on_connect_failed(&self, _device: &Arc<Device>, failure: ConnectFailure) {
        self.push(Seen::ConnectFailed(failure));
    }

    fn on_connect_timeout(&self, _device: &Arc<Device>, kind: ConnectTimeoutKind) {
        self.push(Seen::ConnectTimeout(kind));
    }

    fn on_request_completed(
        &self,
        _device: &Arc<Device>,
        request: &RequestInfo,
        value: &RequestValue,
    ) {
        self.push(Seen::Completed {
            kind: request.kind,
            tag: request.tag.clone(),
            value: value.clone(),
        });
    }

    fn on_request_failed(
        &self,
        _device: &Arc<Device>,
        request: &RequestInfo,
        error: &RequestError,
    ) {
        self.push(Seen::RequestFailed {
            kind: request.kind,
            tag: request.tag.clone(),
            error: error.clone(),
        });
    }

    fn on_characteristic_changed(
        &self,
        _device: &Arc<Device>,
        target: &CharacteristicRef,
        value: &[u8],
    ) {
        self.push(Seen::Changed(*target, value.to_vec()));
    }

    fn on_adapter_state_changed(&self, enabled: bool) {
        self.push(Seen::Adapter(enabled));
    }

    fn on_device_discovered(&self, device: &Arc<Device>) {
        self.push(Seen::Discovered(device.address().clone()));
    }
}

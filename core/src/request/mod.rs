//! GATT request descriptors.
//!
//! A [`RequestDescriptor`] is one operation against a connection: what to do
//! ([`Operation`]), how urgent it is, an optional correlation tag and an
//! optional single-shot callback. Build one with the constructor functions
//! and refine it with the `with_*` methods.

pub mod queue;

pub use queue::RequestQueue;

use crate::config::WriteOptions;
use crate::error::RequestError;
use crate::transport::{CharacteristicRef, DescriptorRef, Phy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operation kind, used for queue filtering and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    SetNotification,
    SetIndication,
    ReadCharacteristic,
    ReadDescriptor,
    WriteCharacteristic,
    ReadRssi,
    ChangeMtu,
    ReadPhy,
    SetPreferredPhy,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The operation a request performs, with its targets and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    SetNotification {
        target: CharacteristicRef,
        enabled: bool,
    },
    SetIndication {
        target: CharacteristicRef,
        enabled: bool,
    },
    ReadCharacteristic {
        target: CharacteristicRef,
    },
    ReadDescriptor {
        target: DescriptorRef,
    },
    WriteCharacteristic {
        target: CharacteristicRef,
        value: Vec<u8>,
    },
    ReadRssi,
    ChangeMtu {
        mtu: u16,
    },
    ReadPhy,
    SetPreferredPhy {
        phy: Phy,
        options: u8,
    },
}

impl Operation {
    pub fn kind(&self) -> RequestKind {
        match self {
            Operation::SetNotification { .. } => RequestKind::SetNotification,
            Operation::SetIndication { .. } => RequestKind::SetIndication,
            Operation::ReadCharacteristic { .. } => RequestKind::ReadCharacteristic,
            Operation::ReadDescriptor { .. } => RequestKind::ReadDescriptor,
            Operation::WriteCharacteristic { .. } => RequestKind::WriteCharacteristic,
            Operation::ReadRssi => RequestKind::ReadRssi,
            Operation::ChangeMtu { .. } => RequestKind::ChangeMtu,
            Operation::ReadPhy => RequestKind::ReadPhy,
            Operation::SetPreferredPhy { .. } => RequestKind::SetPreferredPhy,
        }
    }

    /// Characteristic addressed by the operation, if any
    pub fn characteristic(&self) -> Option<CharacteristicRef> {
        match self {
            Operation::SetNotification { target, .. }
            | Operation::SetIndication { target, .. }
            | Operation::ReadCharacteristic { target }
            | Operation::WriteCharacteristic { target, .. } => Some(*target),
            Operation::ReadDescriptor { target } => Some(target.characteristic_ref()),
            _ => None,
        }
    }

    pub fn descriptor(&self) -> Option<DescriptorRef> {
        match self {
            Operation::ReadDescriptor { target } => Some(*target),
            _ => None,
        }
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestValue {
    /// Notification or indication switched
    NotificationChanged { enabled: bool },
    Characteristic(Vec<u8>),
    Descriptor(Vec<u8>),
    /// The full payload that was written
    Written(Vec<u8>),
    Rssi(i16),
    Mtu(u16),
    Phy(Phy),
}

pub type RequestResult = Result<RequestValue, RequestError>;

/// Single-shot completion callback
pub type RequestCallback = Box<dyn FnOnce(RequestResult) + Send + 'static>;

/// Snapshot of a request carried by events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub kind: RequestKind,
    pub priority: i32,
    pub tag: Option<String>,
    pub characteristic: Option<CharacteristicRef>,
    pub descriptor: Option<DescriptorRef>,
}

/// One pending or in-flight operation
pub struct RequestDescriptor {
    id: RequestId,
    operation: Operation,
    priority: i32,
    tag: Option<String>,
    callback: Option<RequestCallback>,
    write_options: Option<WriteOptions>,
}

impl RequestDescriptor {
    pub fn new(operation: Operation) -> Self {
        Self {
            id: RequestId::next(),
            operation,
            priority: 0,
            tag: None,
            callback: None,
            write_options: None,
        }
    }

    pub fn set_notification(target: CharacteristicRef, enabled: bool) -> Self {
        Self::new(Operation::SetNotification { target, enabled })
    }

    pub fn set_indication(target: CharacteristicRef, enabled: bool) -> Self {
        Self::new(Operation::SetIndication { target, enabled })
    }

    pub fn read_characteristic(target: CharacteristicRef) -> Self {
        Self::new(Operation::ReadCharacteristic { target })
    }

    pub fn read_descriptor(target: DescriptorRef) -> Self {
        Self::new(Operation::ReadDescriptor { target })
    }

    pub fn write_characteristic(target: CharacteristicRef, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Operation::WriteCharacteristic {
            target,
            value: value.into(),
        })
    }

    pub fn read_rssi() -> Self {
        Self::new(Operation::ReadRssi)
    }

    pub fn change_mtu(mtu: u16) -> Self {
        Self::new(Operation::ChangeMtu { mtu })
    }

    pub fn read_phy() -> Self {
        Self::new(Operation::ReadPhy)
    }

    pub fn set_preferred_phy(phy: Phy, options: u8) -> Self {
        Self::new(Operation::SetPreferredPhy { phy, options })
    }

    /// Higher runs first
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_callback(mut self, callback: impl FnOnce(RequestResult) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Chunking policy for this write, overriding the connection default
    pub fn with_write_options(mut self, options: WriteOptions) -> Self {
        self.write_options = Some(options);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn kind(&self) -> RequestKind {
        self.operation.kind()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn write_options(&self) -> Option<&WriteOptions> {
        self.write_options.as_ref()
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id,
            kind: self.kind(),
            priority: self.priority,
            tag: self.tag.clone(),
            characteristic: self.operation.characteristic(),
            descriptor: self.operation.descriptor(),
        }
    }

    /// Chain a second callback after the existing one
    pub(crate) fn chain_callback(&mut self, next: impl FnOnce(RequestResult) + Send + 'static) {
        let callback: RequestCallback = match self.callback.take() {
            Some(first) => Box::new(move |result: RequestResult| {
                first(result.clone());
                next(result);
            }),
            None => Box::new(next),
        };
        self.callback = Some(callback);
    }

    /// Consume the descriptor and run its callback
    pub(crate) fn complete(mut self, result: RequestResult) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("priority", &self.priority)
            .field("tag", &self.tag)
            .field("callback", &self.callback.is_some())
            .field("write_options", &self.write_options)
            .finish()
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id)?;
        if let Some(tag) = &self.tag {
            write!(f, " [{}]", tag)?;
        }
        Ok(())
    }
}

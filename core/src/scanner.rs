//! Scanner backend selection and scan state
//!
//! The platform offers up to three discovery backends. One is chosen once,
//! from the adapter capabilities and an optional preference, the first time
//! the registry or a connection waiting to reconnect needs to scan.
//! Discovery results are not produced here; the platform feeds them to
//! [`crate::Registry::on_device_discovered`].

use crate::connection::ConnectionId;
use crate::error::TransportError;
use crate::transport::{Transport, TransportCapabilities};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Discovery backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScannerKind {
    /// Legacy LE scan callback API
    Legacy,
    /// Advertisement scanner
    Le,
    /// BR/EDR inquiry
    Classic,
}

impl fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerKind::Legacy => write!(f, "legacy"),
            ScannerKind::Le => write!(f, "le"),
            ScannerKind::Classic => write!(f, "classic"),
        }
    }
}

impl ScannerKind {
    fn supported_by(&self, capabilities: &TransportCapabilities) -> bool {
        match self {
            ScannerKind::Legacy => capabilities.legacy_scan,
            ScannerKind::Le => capabilities.le_scan,
            ScannerKind::Classic => capabilities.classic_scan,
        }
    }

    /// Pick the backend: the preference when supported, otherwise the best
    /// available one (LE, then legacy, then classic)
    pub fn select(
        capabilities: &TransportCapabilities,
        preference: Option<ScannerKind>,
    ) -> Option<ScannerKind> {
        if let Some(kind) = preference.filter(|k| k.supported_by(capabilities)) {
            return Some(kind);
        }
        [ScannerKind::Le, ScannerKind::Legacy, ScannerKind::Classic]
            .into_iter()
            .find(|k| k.supported_by(capabilities))
    }
}

/// Scanner bound to one backend
pub struct Scanner {
    kind: ScannerKind,
    scanning: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl Scanner {
    pub fn new(kind: ScannerKind, transport: Arc<dyn Transport>) -> Self {
        info!("Scanner selected: {}", kind);
        Self {
            kind,
            scanning: AtomicBool::new(false),
            transport,
        }
    }

    pub fn kind(&self) -> ScannerKind {
        self.kind
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<(), TransportError> {
        if self.is_scanning() {
            return Ok(());
        }
        self.transport.start_scan(self.kind)?;
        self.scanning.store(true, Ordering::SeqCst);
        debug!("scan started ({})", self.kind);
        Ok(())
    }

    pub fn stop(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.transport.stop_scan(self.kind);
            debug!("scan stopped ({})", self.kind);
        }
    }

    /// The stack stops scanning on its own when the radio goes down
    pub fn on_adapter_off(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }
}

/// One scanner shared by the application and by connections waiting to
/// reconnect. Scanning stops once neither of them wants it.
pub(crate) struct ScanCoordinator {
    transport: Arc<dyn Transport>,
    preference: Option<ScannerKind>,
    scanner: Mutex<Option<Arc<Scanner>>>,
    waiting: Mutex<HashSet<ConnectionId>>,
    /// Scanning asked for through the registry
    requested: AtomicBool,
}

impl ScanCoordinator {
    pub(crate) fn new(transport: Arc<dyn Transport>, preference: Option<ScannerKind>) -> Self {
        Self {
            transport,
            preference,
            scanner: Mutex::new(None),
            waiting: Mutex::new(HashSet::new()),
            requested: AtomicBool::new(false),
        }
    }

    /// The scanner, selected on first use
    pub(crate) fn scanner(&self) -> Result<Arc<Scanner>, TransportError> {
        let mut slot = self.scanner.lock();
        if let Some(scanner) = slot.as_ref() {
            return Ok(Arc::clone(scanner));
        }
        let kind = ScannerKind::select(&self.transport.capabilities(), self.preference)
            .ok_or(TransportError::Unsupported)?;
        let scanner = Arc::new(Scanner::new(kind, Arc::clone(&self.transport)));
        *slot = Some(Arc::clone(&scanner));
        Ok(scanner)
    }

    pub(crate) fn current(&self) -> Option<Arc<Scanner>> {
        self.scanner.lock().clone()
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.current().map_or(false, |s| s.is_scanning())
    }

    pub(crate) fn start_requested(&self) -> Result<(), TransportError> {
        self.requested.store(true, Ordering::SeqCst);
        self.scanner()?.start()
    }

    /// Stop application scanning; keeps going while connections wait
    pub(crate) fn stop_requested(&self) {
        self.requested.store(false, Ordering::SeqCst);
        if self.waiting.lock().is_empty() {
            self.stop_now();
        }
    }

    /// A connection entered its reconnection wait
    pub(crate) fn begin_wait(&self, id: ConnectionId) {
        self.waiting.lock().insert(id);
        if let Err(e) = self.scanner().and_then(|s| s.start()) {
            warn!("scan for reconnection not started: {}", e);
        }
    }

    /// A connection left its reconnection wait
    pub(crate) fn end_wait(&self, id: ConnectionId) {
        let idle = {
            let mut waiting = self.waiting.lock();
            waiting.remove(&id);
            waiting.is_empty()
        };
        if idle && !self.requested.load(Ordering::SeqCst) {
            self.stop_now();
        }
    }

    pub(crate) fn on_adapter_off(&self) {
        self.requested.store(false, Ordering::SeqCst);
        if let Some(scanner) = self.current() {
            scanner.on_adapter_off();
        }
    }

    /// Stop regardless of who is waiting
    pub(crate) fn stop_all(&self) {
        self.requested.store(false, Ordering::SeqCst);
        self.waiting.lock().clear();
        self.stop_now();
    }

    fn stop_now(&self) {
        if let Some(scanner) = self.current() {
            scanner.stop();
        }
    }
}

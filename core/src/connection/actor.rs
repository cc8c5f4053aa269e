//! Connection task.
//!
//! Owns the link state machine and the request queue. Transport calls run
//! in spawned continuations that report back with the sequence number they
//! were started under; results carrying a stale sequence are ignored, which
//! is how cancelled or superseded operations fall away.

use super::write::write_chunked;
use super::{Command, ConnectionHandle, ConnectionId, Shared};
use crate::bus::EventBus;
use crate::config::{ConnectionConfiguration, WriteOptions, DEFAULT_MTU};
use crate::device::{Address, ConnectionState, Device};
use crate::error::{RequestError, TransportError};
use crate::event::{ConnectFailure, ConnectTimeoutKind, Event, EventObserver};
use crate::request::{
    Operation, RequestDescriptor, RequestId, RequestQueue, RequestResult, RequestValue,
};
use crate::scanner::ScanCoordinator;
use crate::transport::{GattService, LinkEvent, Transport};
use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Bring-up requests run ahead of everything queued by callers
const BRING_UP_PRIORITY: i32 = i32::MAX;

/// Called once when the connection is released
pub(crate) type ReleaseHook = Box<dyn FnOnce(ConnectionId, &Address) + Send + 'static>;

/// Link close in progress; completes once the transport has closed the link
type Closing = SharedFuture<BoxFuture<'static, ()>>;

/// Everything needed to start a connection task
pub(crate) struct ConnectionSetup {
    pub id: ConnectionId,
    pub device: Arc<Device>,
    pub config: ConnectionConfiguration,
    pub transport: Arc<dyn Transport>,
    pub observer: Option<Arc<dyn EventObserver>>,
    pub bus: EventBus,
    pub scans: Arc<ScanCoordinator>,
    pub on_release: Option<ReleaseHook>,
    /// Resolves once the connection this one replaces has closed its link
    pub predecessor: Option<oneshot::Receiver<()>>,
    /// Delay before the first connect attempt (bond settle time)
    pub start_delay: Option<Duration>,
    pub adapter_enabled: bool,
}

/// Spawn the connection task and return its handle
pub(crate) fn spawn(setup: ConnectionSetup) -> ConnectionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

    setup
        .device
        .set_connection_state(ConnectionState::Disconnected);

    let shared = Arc::new(Shared {
        device: Arc::clone(&setup.device),
        mtu: RwLock::new(DEFAULT_MTU),
        services: RwLock::new(Vec::new()),
        auto_reconnect: setup.config.auto_reconnect,
        released: AtomicBool::new(false),
    });

    let start_at = setup.start_delay.map(|d| Instant::now() + d);
    let actor = ConnectionActor {
        id: setup.id,
        shared: Arc::clone(&shared),
        device: setup.device,
        config: setup.config,
        transport: setup.transport,
        observer: setup.observer,
        bus: setup.bus,
        scans: setup.scans,
        on_release: setup.on_release,
        predecessor: setup.predecessor,
        commands: command_rx,
        outcome_tx,
        outcomes: outcome_rx,
        link_events: None,
        link_task: None,
        link_seq: 0,
        closing: None,
        queue: RequestQueue::new(),
        in_flight: None,
        seq: 0,
        last_emitted: None,
        start_at,
        pending_start: start_at.is_none(),
        connect_deadline: None,
        discover_at: None,
        reconnect_at: None,
        scan_deadline: None,
        scan_wait: false,
        attempts: 0,
        immediate_retries: 0,
        waits_served: 0,
        adapter_enabled: setup.adapter_enabled,
        bring_up_mtu: None,
    };

    tokio::spawn(actor.run());
    ConnectionHandle::new(setup.id, shared, command_tx)
}

/// Results posted back by continuations
enum Outcome {
    LinkOpened {
        seq: u64,
        result: Result<(), TransportError>,
    },
    ServicesDiscovered {
        seq: u64,
        result: Result<Vec<GattService>, TransportError>,
    },
    RequestFinished {
        seq: u64,
        result: RequestResult,
    },
}

enum Step {
    Command(Command),
    Closed,
    Outcome(Outcome),
    Link(Option<LinkEvent>),
    Timer,
}

struct InFlight {
    request: RequestDescriptor,
    seq: u64,
    task: JoinHandle<()>,
}

struct ConnectionActor {
    id: ConnectionId,
    shared: Arc<Shared>,
    device: Arc<Device>,
    config: ConnectionConfiguration,
    transport: Arc<dyn Transport>,
    observer: Option<Arc<dyn EventObserver>>,
    bus: EventBus,
    scans: Arc<ScanCoordinator>,
    on_release: Option<ReleaseHook>,
    predecessor: Option<oneshot::Receiver<()>>,

    commands: mpsc::UnboundedReceiver<Command>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    link_task: Option<JoinHandle<()>>,
    link_seq: u64,
    closing: Option<Closing>,

    queue: RequestQueue,
    in_flight: Option<InFlight>,
    seq: u64,
    last_emitted: Option<ConnectionState>,

    start_at: Option<Instant>,
    /// First attempt still owed (delayed start or adapter was off)
    pending_start: bool,
    connect_deadline: Option<Instant>,
    discover_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Next "never seen again" timeout while waiting to reconnect
    scan_deadline: Option<Instant>,
    /// Registered with the scan coordinator
    scan_wait: bool,

    attempts: u32,
    immediate_retries: u32,
    waits_served: u32,
    adapter_enabled: bool,
    bring_up_mtu: Option<RequestId>,
}

async fn next_link_event(
    rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>,
) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

fn is_due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map_or(false, |d| d <= now)
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!("{} started for {}", self.id, self.device);
        if let Some(predecessor) = self.predecessor.take() {
            // Never open a link while the replaced one is still closing
            let _ = predecessor.await;
        }
        if self.pending_start && self.adapter_enabled {
            self.pending_start = false;
            self.start_attempt();
        }

        loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                },
                Some(outcome) = self.outcomes.recv() => Step::Outcome(outcome),
                event = next_link_event(&mut self.link_events) => Step::Link(event),
                _ = sleep_until_opt(deadline) => Step::Timer,
            };

            match step {
                Step::Command(Command::Release { notify, reply }) => {
                    self.release(notify);
                    if let Some(closing) = self.closing.take() {
                        closing.await;
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                Step::Command(command) => self.on_command(command),
                Step::Closed => {
                    self.release(false);
                    break;
                }
                Step::Outcome(outcome) => self.on_outcome(outcome),
                Step::Link(event) => self.on_link_event(event),
                Step::Timer => self.on_timer(),
            }
        }

        self.drain_after_release();
        debug!("{} stopped", self.id);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.start_at,
            self.connect_deadline,
            self.discover_at,
            self.reconnect_at,
            self.scan_deadline,
            self.queue.next_expiry(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn state(&self) -> ConnectionState {
        self.device.connection_state()
    }

    // ----- events -----

    fn emit(&self, event: Event) {
        if let Some(observer) = &self.observer {
            event.dispatch(observer.as_ref());
        }
        self.bus.notify(&event);
    }

    /// Record a state and emit it unless it equals the last emitted one
    fn set_state(&mut self, state: ConnectionState) {
        self.device.set_connection_state(state);
        if self.last_emitted != Some(state) {
            self.last_emitted = Some(state);
            debug!("{} -> {}", self.device, state);
            self.emit(Event::ConnectionStateChanged {
                device: Arc::clone(&self.device),
                state,
            });
        }
    }

    fn finish(&self, request: RequestDescriptor, result: RequestResult) {
        let info = request.info();
        let event = match &result {
            Ok(value) => {
                debug!("{} completed on {}", request, self.device);
                Event::RequestCompleted {
                    device: Arc::clone(&self.device),
                    request: info,
                    value: value.clone(),
                }
            }
            Err(error) => {
                debug!("{} failed on {}: {}", request, self.device, error);
                Event::RequestFailed {
                    device: Arc::clone(&self.device),
                    request: info,
                    error: error.clone(),
                }
            }
        };
        request.complete(result);
        self.emit(event);
    }

    // ----- commands -----

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Execute(request) => self.enqueue(request),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect => self.reconnect(),
            Command::Refresh => self.refresh(),
            Command::AdapterState { enabled, reply } => {
                self.on_adapter_state(enabled);
                let _ = reply.send(());
            }
            Command::DeviceDiscovered => {
                let waiting = self.state() == ConnectionState::ScanningForReconnection;
                if waiting && self.adapter_enabled {
                    debug!("{} seen again, reconnecting now", self.device);
                    self.begin_reconnect_attempt();
                }
            }
            Command::ClearQueue { kind } => {
                let removed = match kind {
                    Some(kind) => self.queue.drain_kind(kind),
                    None => self.queue.drain_all(),
                };
                for request in removed {
                    self.finish(request, Err(RequestError::Cancelled));
                }
            }
            // Handled by the run loop
            Command::Release { .. } => {}
        }
    }

    fn enqueue(&mut self, request: RequestDescriptor) {
        if !self.adapter_enabled {
            self.finish(request, Err(RequestError::AdapterOff));
            return;
        }
        let expires_at = Instant::now() + self.config.request_timeout();
        self.queue.push(request, expires_at);
        self.pump();
    }

    fn disconnect(&mut self) {
        info!("disconnecting {}", self.device);
        self.start_at = None;
        self.pending_start = false;
        self.reconnect_at = None;
        self.leave_scanning();
        self.teardown_link();
        self.fail_in_flight(RequestError::Disconnected);
        self.fail_queue(RequestError::Disconnected);
        self.set_state(ConnectionState::Disconnected);
    }

    fn reconnect(&mut self) {
        if !self.adapter_enabled || self.state() == ConnectionState::ServiceDiscovered {
            return;
        }
        info!("reconnecting {}", self.device);
        self.reset_counters();
        self.start_attempt();
    }

    fn refresh(&mut self) {
        if !self.adapter_enabled {
            return;
        }
        info!("refreshing {}", self.device);
        self.teardown_link();
        self.fail_in_flight(RequestError::Disconnected);
        self.set_state(ConnectionState::Disconnected);
        self.reset_counters();
        self.start_attempt();
    }

    fn on_adapter_state(&mut self, enabled: bool) {
        if enabled == self.adapter_enabled {
            return;
        }
        self.adapter_enabled = enabled;
        if !enabled {
            if self.start_at.take().is_some() {
                self.pending_start = true;
            }
            self.reconnect_at = None;
            self.leave_scanning();
            self.teardown_link();
            self.fail_in_flight(RequestError::AdapterOff);
            self.fail_queue(RequestError::AdapterOff);
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let idle = matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::ScanningForReconnection
        );
        if self.pending_start || (self.config.auto_reconnect && idle) {
            self.pending_start = false;
            self.reset_counters();
            self.start_attempt();
        }
    }

    fn release(&mut self, notify: bool) {
        info!("releasing {}", self.device);
        self.shared.released.store(true, Ordering::SeqCst);
        self.start_at = None;
        self.reconnect_at = None;
        self.leave_scanning();
        self.teardown_link();
        self.fail_in_flight(RequestError::Cancelled);
        self.fail_queue(RequestError::Cancelled);
        if notify {
            self.set_state(ConnectionState::Released);
        }
        self.observer = None;
        if let Some(hook) = self.on_release.take() {
            hook(self.id, self.device.address());
        }
    }

    /// Requests that raced with release still get their terminal callback
    fn drain_after_release(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Execute(request) => request.complete(Err(RequestError::Cancelled)),
                Command::Release {
                    reply: Some(reply), ..
                } => {
                    let _ = reply.send(());
                }
                Command::AdapterState { reply, .. } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }
    }

    // ----- link lifecycle -----

    fn reset_counters(&mut self) {
        self.attempts = 0;
        self.immediate_retries = 0;
        self.waits_served = 0;
    }

    /// Stop waiting for the device to show up in scan results
    fn leave_scanning(&mut self) {
        self.scan_deadline = None;
        if std::mem::take(&mut self.scan_wait) {
            self.scans.end_wait(self.id);
        }
    }

    /// Abort link continuations and close the link if one was open. Closes
    /// run in order and the next open waits for the last one.
    fn teardown_link(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.link_seq = 0;
        self.connect_deadline = None;
        self.discover_at = None;
        self.bring_up_mtu = None;
        if self.link_events.take().is_some() {
            let transport = Arc::clone(&self.transport);
            let address = self.device.address().clone();
            let previous = self.closing.take();
            let close = async move {
                if let Some(previous) = previous {
                    previous.await;
                }
                transport.close_link(&address).await;
            }
            .boxed()
            .shared();
            tokio::spawn(close.clone());
            self.closing = Some(close);
        }
    }

    fn start_attempt(&mut self) {
        self.start_at = None;
        self.reconnect_at = None;
        self.leave_scanning();
        self.teardown_link();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.link_events = Some(event_rx);
        let seq = self.next_seq();
        self.link_seq = seq;
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout());
        *self.shared.mtu.write() = DEFAULT_MTU;
        self.set_state(ConnectionState::Connecting);
        info!("connecting {}", self.device);

        let transport = Arc::clone(&self.transport);
        let address = self.device.address().clone();
        let outcomes = self.outcome_tx.clone();
        let closing = self.closing.clone();
        self.link_task = Some(tokio::spawn(async move {
            if let Some(closing) = closing {
                closing.await;
            }
            let result = transport.open_link(&address, event_tx).await;
            let _ = outcomes.send(Outcome::LinkOpened { seq, result });
        }));
    }

    fn begin_reconnect_attempt(&mut self) {
        self.attempts += 1;
        debug!("reconnect attempt {} for {}", self.attempts, self.device);
        self.start_attempt();
    }

    fn start_discovery(&mut self) {
        self.discover_at = None;
        self.set_state(ConnectionState::ServiceDiscovering);
        debug!("discovering services on {}", self.device);

        let seq = self.next_seq();
        self.link_seq = seq;
        let transport = Arc::clone(&self.transport);
        let address = self.device.address().clone();
        let outcomes = self.outcome_tx.clone();
        self.link_task = Some(tokio::spawn(async move {
            let result = transport.discover_services(&address).await;
            let _ = outcomes.send(Outcome::ServicesDiscovered { seq, result });
        }));
    }

    fn may_reconnect(&self) -> bool {
        self.config.auto_reconnect && self.adapter_enabled
    }

    /// The link is gone (drop, failed attempt or timeout)
    fn handle_link_loss(&mut self, reconnect: bool) {
        self.teardown_link();
        self.fail_in_flight(RequestError::Disconnected);

        let retry_now = reconnect
            && self.may_reconnect()
            && self.config.may_attempt_reconnect(self.attempts)
            && self.immediate_retries < self.config.reconnect_immediately_max_times;
        if retry_now && self.last_emitted == Some(ConnectionState::Connecting) {
            // Failed attempt followed by an immediate retry: no transient event
            self.device.set_connection_state(ConnectionState::Disconnected);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }

        if reconnect && self.may_reconnect() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.config.may_attempt_reconnect(self.attempts) {
            warn!(
                "giving up on {} after {} reconnect attempts",
                self.device, self.attempts
            );
            self.emit(Event::ConnectFailed {
                device: Arc::clone(&self.device),
                failure: ConnectFailure::MaximumReconnection,
            });
            self.fail_queue(RequestError::ConnectTimeout);
            return;
        }

        if self.immediate_retries < self.config.reconnect_immediately_max_times {
            self.immediate_retries += 1;
            self.begin_reconnect_attempt();
            return;
        }

        match self.config.backoff.delay_for(self.waits_served) {
            Some(delay) => {
                let now = Instant::now();
                self.waits_served += 1;
                self.reconnect_at = Some(now + delay);
                self.scan_deadline = Some(now + self.config.connect_timeout());
                self.set_state(ConnectionState::ScanningForReconnection);
                if !self.scan_wait {
                    self.scan_wait = true;
                    self.scans.begin_wait(self.id);
                }
                info!("next reconnect for {} in {}ms", self.device, delay.as_millis());
            }
            None => warn!(
                "no backoff step for {} after {} waits, staying disconnected",
                self.device, self.waits_served
            ),
        }
    }

    fn on_connect_timeout(&mut self) {
        let kind = if self.state() == ConnectionState::Connecting {
            ConnectTimeoutKind::CannotConnect
        } else {
            ConnectTimeoutKind::CannotDiscoverServices
        };
        warn!("connect timeout on {} ({:?})", self.device, kind);
        self.emit(Event::ConnectTimeout {
            device: Arc::clone(&self.device),
            kind,
        });
        self.handle_link_loss(true);
        if !self.may_reconnect() {
            // Nothing will bring the link back for queued requests
            self.fail_queue(RequestError::ConnectTimeout);
        }
    }

    // ----- continuations -----

    fn on_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::LinkOpened { seq, result } => {
                if seq != self.link_seq {
                    return;
                }
                self.link_task = None;
                match result {
                    Ok(()) => {
                        info!("connected {}", self.device);
                        self.set_state(ConnectionState::Connected);
                        self.discover_at =
                            Some(Instant::now() + self.config.discover_services_delay());
                    }
                    Err(e) => {
                        warn!("connect to {} failed: {}", self.device, e);
                        let reconnect = e != TransportError::AdapterDisabled;
                        self.handle_link_loss(reconnect);
                    }
                }
            }
            Outcome::ServicesDiscovered { seq, result } => {
                if seq != self.link_seq {
                    return;
                }
                self.link_task = None;
                match result {
                    Ok(services) if !services.is_empty() => {
                        *self.shared.services.write() = services;
                        self.connect_deadline = None;
                        self.reset_counters();
                        self.set_state(ConnectionState::ServiceDiscovered);
                        info!("services discovered on {}", self.device);
                        self.start_bring_up();
                        self.pump();
                    }
                    Ok(_) => {
                        warn!("no services on {}", self.device);
                        self.handle_link_loss(true);
                    }
                    Err(e) => {
                        warn!("service discovery on {} failed: {}", self.device, e);
                        self.handle_link_loss(true);
                    }
                }
            }
            Outcome::RequestFinished { seq, result } => {
                if self.in_flight.as_ref().map(|f| f.seq) != Some(seq) {
                    return;
                }
                let Some(in_flight) = self.in_flight.take() else {
                    return;
                };
                if let Ok(RequestValue::Mtu(mtu)) = &result {
                    *self.shared.mtu.write() = *mtu;
                    debug!("mtu {} on {}", mtu, self.device);
                }
                let id = in_flight.request.id();
                self.finish(in_flight.request, result);
                if self.bring_up_mtu == Some(id) {
                    self.bring_up_mtu = None;
                    self.enqueue_bring_up_followups();
                }
                self.pump();
            }
        }
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            None => {
                // Driver dropped the sender
                self.link_events = None;
            }
            Some(LinkEvent::Disconnected { status }) => {
                let state = self.state();
                if state.has_link() || state == ConnectionState::Connecting {
                    info!("link lost on {} (status {:?})", self.device, status);
                    self.handle_link_loss(true);
                }
            }
            Some(LinkEvent::CharacteristicChanged { target, value }) => {
                if let Some(validator) = &self.config.bring_up.frame_validator {
                    if !validator(&value) {
                        warn!("bad frame on {} from {}, restarting link", target, self.device);
                        self.refresh();
                        return;
                    }
                }
                self.emit(Event::CharacteristicChanged {
                    device: Arc::clone(&self.device),
                    target,
                    value,
                });
            }
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if is_due(self.start_at, now) {
            self.start_at = None;
            if self.adapter_enabled {
                self.pending_start = false;
                self.start_attempt();
            } else {
                self.pending_start = true;
            }
        }
        if is_due(self.reconnect_at, now) {
            self.reconnect_at = None;
            self.begin_reconnect_attempt();
        }
        if is_due(self.connect_deadline, now) {
            self.on_connect_timeout();
        }
        if is_due(self.discover_at, now) {
            self.start_discovery();
        }
        if is_due(self.scan_deadline, now) {
            warn!("{} not seen while waiting to reconnect", self.device);
            self.scan_deadline = Some(now + self.config.connect_timeout());
            self.emit(Event::ConnectTimeout {
                device: Arc::clone(&self.device),
                kind: ConnectTimeoutKind::CannotDiscoverDevice,
            });
        }
        for request in self.queue.drain_expired(now) {
            self.finish(request, Err(RequestError::RequestTimeout));
        }
        self.pump();
    }

    // ----- request execution -----

    fn start_bring_up(&mut self) {
        let mtu = self
            .config
            .bring_up
            .mtu
            .as_ref()
            .and_then(|policy| policy(&self.device));
        match mtu {
            Some(mtu) => {
                let request = RequestDescriptor::change_mtu(mtu).with_priority(BRING_UP_PRIORITY);
                self.bring_up_mtu = Some(request.id());
                self.enqueue(request);
            }
            None => self.enqueue_bring_up_followups(),
        }
    }

    fn enqueue_bring_up_followups(&mut self) {
        if let Some(target) = self.config.bring_up.notify {
            let request = RequestDescriptor::set_notification(target, true);
            self.enqueue(request.with_priority(BRING_UP_PRIORITY));
        }
        if let Some(target) = self.config.bring_up.initial_read {
            let request = RequestDescriptor::read_characteristic(target);
            self.enqueue(request.with_priority(BRING_UP_PRIORITY));
        }
    }

    fn fail_in_flight(&mut self, error: RequestError) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
            if self.bring_up_mtu == Some(in_flight.request.id()) {
                self.bring_up_mtu = None;
            }
            self.finish(in_flight.request, Err(error));
        }
    }

    fn fail_queue(&mut self, error: RequestError) {
        for request in self.queue.drain_all() {
            self.finish(request, Err(error.clone()));
        }
    }

    fn check_target(&self, operation: &Operation) -> Result<(), RequestError> {
        let Some(target) = operation.characteristic() else {
            return Ok(());
        };
        let services = self.shared.services.read();
        let service = services
            .iter()
            .find(|s| s.uuid == target.service)
            .ok_or(RequestError::ServiceNotFound)?;
        let characteristic = service
            .characteristic(&target.characteristic)
            .ok_or(RequestError::CharacteristicNotFound)?;
        if let Some(descriptor) = operation.descriptor() {
            if !characteristic.descriptors.contains(&descriptor.descriptor) {
                return Err(RequestError::DescriptorNotFound);
            }
        }
        Ok(())
    }

    /// Start the next queued request if the link is ready and idle
    fn pump(&mut self) {
        if self.in_flight.is_some() || self.state() != ConnectionState::ServiceDiscovered {
            return;
        }
        for request in self.queue.drain_expired(Instant::now()) {
            self.finish(request, Err(RequestError::RequestTimeout));
        }
        while let Some(request) = self.queue.pop() {
            match self.check_target(request.operation()) {
                Ok(()) => {
                    self.launch(request);
                    return;
                }
                Err(error) => self.finish(request, Err(error)),
            }
        }
    }

    fn launch(&mut self, request: RequestDescriptor) {
        let seq = self.next_seq();
        let operation = request.operation().clone();
        let write_options = match &operation {
            Operation::WriteCharacteristic { target, .. } => request
                .write_options()
                .or_else(|| self.config.default_write_options(target))
                .cloned()
                .unwrap_or_default(),
            _ => WriteOptions::default(),
        };
        debug!("executing {} on {}", request, self.device);

        let transport = Arc::clone(&self.transport);
        let address = self.device.address().clone();
        let mtu = *self.shared.mtu.read();
        let request_timeout = self.config.request_timeout();
        let outcomes = self.outcome_tx.clone();
        let task = tokio::spawn(async move {
            let result = perform(
                transport.as_ref(),
                &address,
                operation,
                &write_options,
                mtu,
                request_timeout,
            )
            .await;
            let _ = outcomes.send(Outcome::RequestFinished { seq, result });
        });
        self.in_flight = Some(InFlight { request, seq, task });
    }
}

/// Run one operation against the transport
async fn perform(
    transport: &dyn Transport,
    address: &Address,
    operation: Operation,
    write_options: &WriteOptions,
    mtu: u16,
    request_timeout: Duration,
) -> RequestResult {
    match operation {
        // Acknowledged writes time out per chunk, unacknowledged ones as a whole
        Operation::WriteCharacteristic { target, value } => {
            write_chunked(
                transport,
                address,
                &target,
                value,
                write_options,
                mtu,
                request_timeout,
            )
            .await
        }
        other => match timeout(request_timeout, call(transport, address, other)).await {
            Ok(result) => result.map_err(RequestError::from),
            Err(_) => Err(RequestError::RequestTimeout),
        },
    }
}

async fn call(
    transport: &dyn Transport,
    address: &Address,
    operation: Operation,
) -> Result<RequestValue, TransportError> {
    match operation {
        Operation::SetNotification { target, enabled } => transport
            .set_notification(address, &target, enabled, false)
            .await
            .map(|_| RequestValue::NotificationChanged { enabled }),
        Operation::SetIndication { target, enabled } => transport
            .set_notification(address, &target, enabled, true)
            .await
            .map(|_| RequestValue::NotificationChanged { enabled }),
        Operation::ReadCharacteristic { target } => transport
            .read_characteristic(address, &target)
            .await
            .map(RequestValue::Characteristic),
        Operation::ReadDescriptor { target } => transport
            .read_descriptor(address, &target)
            .await
            .map(RequestValue::Descriptor),
        Operation::ReadRssi => transport.read_rssi(address).await.map(RequestValue::Rssi),
        Operation::ChangeMtu { mtu } => transport
            .request_mtu(address, mtu)
            .await
            .map(RequestValue::Mtu),
        Operation::ReadPhy => transport.read_phy(address).await.map(RequestValue::Phy),
        Operation::SetPreferredPhy { phy, options } => transport
            .set_preferred_phy(address, phy, options)
            .await
            .map(RequestValue::Phy),
        // Routed through write_chunked by perform
        Operation::WriteCharacteristic { .. } => Err(TransportError::Unsupported),
    }
}

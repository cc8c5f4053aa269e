//! Observer registry with per-subscriber delivery lanes.
//!
//! `Posting` subscribers are called inline on the publishing task.
//! `Dedicated` subscribers each get their own tokio task fed by an unbounded
//! channel, so a slow observer only delays itself. Nothing is delivered to
//! a subscription once it is removed, including events already queued.

use crate::event::{Event, EventObserver};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where an observer's callbacks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThreadMode {
    /// On the publishing task, before `notify` returns
    #[default]
    Posting,
    /// On a FIFO lane owned by the subscription
    Dedicated,
}

struct Subscription {
    observer: Arc<dyn EventObserver>,
    tag: Option<String>,
    lane: Option<mpsc::UnboundedSender<Event>>,
    /// Cleared on removal; checked before every delivery
    active: Arc<AtomicBool>,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn accepts(&self, event: &Event) -> bool {
        match &self.tag {
            Some(tag) => event.tag() == Some(tag.as_str()),
            None => true,
        }
    }
}

fn same_observer(a: &Arc<dyn EventObserver>, b: &Arc<dyn EventObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Event bus. Clones share subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Arc<Subscription>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Returns false if it was already registered, in
    /// which case the existing subscription is left untouched.
    pub fn register(
        &self,
        observer: Arc<dyn EventObserver>,
        mode: ThreadMode,
        tag: Option<String>,
    ) -> bool {
        let mut subscriptions = self.subscriptions.write();
        if subscriptions
            .iter()
            .any(|s| same_observer(&s.observer, &observer))
        {
            return false;
        }

        let active = Arc::new(AtomicBool::new(true));
        let lane = match mode {
            ThreadMode::Posting => None,
            ThreadMode::Dedicated => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
                    let lane_observer = Arc::clone(&observer);
                    let lane_active = Arc::clone(&active);
                    handle.spawn(async move {
                        while let Some(event) = rx.recv().await {
                            if !lane_active.load(Ordering::SeqCst) {
                                break;
                            }
                            event.dispatch(lane_observer.as_ref());
                        }
                    });
                    Some(tx)
                }
                Err(_) => {
                    warn!("No runtime for a dedicated lane, delivering inline");
                    None
                }
            },
        };

        subscriptions.push(Arc::new(Subscription {
            observer,
            tag,
            lane,
            active,
        }));
        debug!("Observer registered ({} total)", subscriptions.len());
        true
    }

    /// Remove an observer. Events still queued on its lane are dropped.
    pub fn unregister(&self, observer: &Arc<dyn EventObserver>) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| {
            let keep = !same_observer(&s.observer, observer);
            if !keep {
                s.deactivate();
            }
            keep
        });
        before != subscriptions.len()
    }

    pub fn is_registered(&self, observer: &Arc<dyn EventObserver>) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|s| same_observer(&s.observer, observer))
    }

    pub fn unregister_all(&self) {
        for subscription in self.subscriptions.write().drain(..) {
            subscription.deactivate();
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Deliver an event to every matching subscriber
    pub fn notify(&self, event: &Event) {
        // Snapshot so observers may (un)register from inside a callback
        let subscriptions: Vec<Arc<Subscription>> = self.subscriptions.read().clone();
        for subscription in subscriptions.iter().filter(|s| s.accepts(event)) {
            // Removed by an earlier callback in this round
            if !subscription.is_active() {
                continue;
            }
            match &subscription.lane {
                Some(lane) => {
                    if lane.send(event.clone()).is_err() {
                        warn!("Observer lane closed, dropping {}", event);
                    }
                }
                None => event.dispatch(subscription.observer.as_ref()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionState, Device};
    use crate::error::RequestError;
    use crate::request::{RequestDescriptor, RequestInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        states: AtomicUsize,
        failures: AtomicUsize,
    }

    impl EventObserver for Counter {
        fn on_connection_state_changed(&self, _device: &Arc<Device>, _state: ConnectionState) {
            self.states.fetch_add(1, Ordering::SeqCst);
        }

        fn on_request_failed(
            &self,
            _device: &Arc<Device>,
            _request: &RequestInfo,
            _error: &RequestError,
        ) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn state_event() -> Event {
        Event::ConnectionStateChanged {
            device: Arc::new(Device::new("00:11:22:33:44:55")),
            state: ConnectionState::Connected,
        }
    }

    fn failed_event(tag: Option<&str>) -> Event {
        let mut request = RequestDescriptor::read_rssi();
        if let Some(tag) = tag {
            request = request.with_tag(tag);
        }
        Event::RequestFailed {
            device: Arc::new(Device::new("00:11:22:33:44:55")),
            request: request.info(),
            error: RequestError::RequestTimeout,
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter::default());
        let observer: Arc<dyn EventObserver> = counter.clone();

        assert!(bus.register(observer.clone(), ThreadMode::Posting, None));
        assert!(!bus.register(observer.clone(), ThreadMode::Posting, None));
        assert_eq!(bus.len(), 1);

        bus.notify(&state_event());
        assert_eq!(counter.states.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter::default());
        let observer: Arc<dyn EventObserver> = counter.clone();
        bus.register(observer.clone(), ThreadMode::Posting, None);
        assert!(bus.is_registered(&observer));
        assert!(bus.unregister(&observer));
        assert!(!bus.unregister(&observer));

        bus.notify(&state_event());
        assert_eq!(counter.states.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tag_filter() {
        let bus = EventBus::new();
        let tagged = Arc::new(Counter::default());
        let untagged = Arc::new(Counter::default());
        bus.register(tagged.clone(), ThreadMode::Posting, Some("ota".to_string()));
        bus.register(untagged.clone(), ThreadMode::Posting, None);

        bus.notify(&failed_event(Some("ota")));
        bus.notify(&failed_event(Some("poll")));
        bus.notify(&failed_event(None));
        bus.notify(&state_event());

        assert_eq!(tagged.failures.load(Ordering::SeqCst), 1);
        assert_eq!(tagged.states.load(Ordering::SeqCst), 0);
        assert_eq!(untagged.failures.load(Ordering::SeqCst), 3);
        assert_eq!(untagged.states.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_all() {
        let bus = EventBus::new();
        bus.register(Arc::new(Counter::default()), ThreadMode::Posting, None);
        bus.register(Arc::new(Counter::default()), ThreadMode::Posting, None);
        bus.unregister_all();
        assert!(bus.is_empty());
    }

    struct Unsubscriber {
        bus: EventBus,
    }

    impl EventObserver for Unsubscriber {
        fn on_connection_state_changed(&self, _device: &Arc<Device>, _state: ConnectionState) {
            self.bus.unregister_all();
        }
    }

    #[test]
    fn test_unregister_inside_callback_stops_the_round() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter::default());
        bus.register(
            Arc::new(Unsubscriber { bus: bus.clone() }),
            ThreadMode::Posting,
            None,
        );
        bus.register(counter.clone(), ThreadMode::Posting, None);

        bus.notify(&state_event());
        assert!(bus.is_empty());
        assert_eq!(counter.states.load(Ordering::SeqCst), 0);
    }

    struct Slow {
        seen: AtomicUsize,
    }

    impl EventObserver for Slow {
        fn on_connection_state_changed(&self, _device: &Arc<Device>, _state: ConnectionState) {
            std::thread::sleep(Duration::from_millis(50));
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dedicated_lane_does_not_block_posting() {
        let bus = EventBus::new();
        let slow = Arc::new(Slow {
            seen: AtomicUsize::new(0),
        });
        let fast = Arc::new(Counter::default());
        bus.register(slow.clone(), ThreadMode::Dedicated, None);
        bus.register(fast.clone(), ThreadMode::Posting, None);

        for _ in 0..3 {
            bus.notify(&state_event());
        }
        // Inline delivery already happened; the slow lane is still working
        assert_eq!(fast.states.load(Ordering::SeqCst), 3);
        assert!(slow.seen.load(Ordering::SeqCst) < 3);

        for _ in 0..50 {
            if slow.seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(slow.seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregister_all_drops_queued_lane_events() {
        let bus = EventBus::new();
        let slow = Arc::new(Slow {
            seen: AtomicUsize::new(0),
        });
        bus.register(slow.clone(), ThreadMode::Dedicated, None);

        for _ in 0..5 {
            bus.notify(&state_event());
        }
        bus.unregister_all();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // At most the event already being handled finishes
        assert!(slow.seen.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregister_drops_queued_lane_events() {
        let bus = EventBus::new();
        let slow = Arc::new(Slow {
            seen: AtomicUsize::new(0),
        });
        let observer: Arc<dyn EventObserver> = slow.clone();
        bus.register(observer.clone(), ThreadMode::Dedicated, None);

        for _ in 0..5 {
            bus.notify(&state_event());
        }
        assert!(bus.unregister(&observer));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(slow.seen.load(Ordering::SeqCst) <= 1);
    }
}

/// Priority request queue for one connection
///
/// Highest priority first; equal priorities keep arrival order. Each entry
/// carries the instant after which it is dropped with a timeout if it has
/// not started executing.

use super::{RequestDescriptor, RequestKind};
use tokio::time::Instant;

struct QueuedRequest {
    request: RequestDescriptor,
    expires_at: Instant,
}

/// Stable priority queue of pending requests
#[derive(Default)]
pub struct RequestQueue {
    items: Vec<QueuedRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Add a request behind every queued request of the same or higher priority
    pub fn push(&mut self, request: RequestDescriptor, expires_at: Instant) {
        let priority = request.priority();
        let index = self
            .items
            .partition_point(|q| q.request.priority() >= priority);
        self.items.insert(
            index,
            QueuedRequest {
                request,
                expires_at,
            },
        );
    }

    /// Take the next request to execute
    pub fn pop(&mut self) -> Option<RequestDescriptor> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0).request)
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Earliest expiry among queued requests
    pub fn next_expiry(&self) -> Option<Instant> {
        self.items.iter().map(|q| q.expires_at).min()
    }

    /// Remove every request whose expiry is at or before `now`
    pub fn drain_expired(&mut self, now: Instant) -> Vec<RequestDescriptor> {
        self.drain_where(|q| q.expires_at <= now)
    }

    /// Remove every request of the given kind
    pub fn drain_kind(&mut self, kind: RequestKind) -> Vec<RequestDescriptor> {
        self.drain_where(|q| q.request.kind() == kind)
    }

    /// Remove everything, in execution order
    pub fn drain_all(&mut self) -> Vec<RequestDescriptor> {
        self.items.drain(..).map(|q| q.request).collect()
    }

    fn drain_where(
        &mut self,
        mut pred: impl FnMut(&QueuedRequest) -> bool,
    ) -> Vec<RequestDescriptor> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if pred(&item) {
                removed.push(item.request);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn rssi(priority: i32, tag: &str) -> RequestDescriptor {
        RequestDescriptor::read_rssi()
            .with_priority(priority)
            .with_tag(tag)
    }

    #[test]
    fn test_priority_order() {
        let now = Instant::now();
        let mut queue = RequestQueue::new();
        queue.push(rssi(1, "a"), now);
        queue.push(rssi(5, "b"), now);
        queue.push(rssi(3, "c"), now);

        let order: Vec<i32> = std::iter::from_fn(|| queue.pop())
            .map(|r| r.priority())
            .collect();
        assert_eq!(order, vec![5, 3, 1]);
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let now = Instant::now();
        let mut queue = RequestQueue::new();
        queue.push(rssi(2, "first"), now);
        queue.push(rssi(2, "second"), now);
        queue.push(rssi(7, "urgent"), now);
        queue.push(rssi(2, "third"), now);

        let tags: Vec<String> = std::iter::from_fn(|| queue.pop())
            .filter_map(|r| r.tag().map(str::to_string))
            .collect();
        assert_eq!(tags, vec!["urgent", "first", "second", "third"]);
    }

    #[test]
    fn test_drain_expired() {
        let now = Instant::now();
        let mut queue = RequestQueue::new();
        queue.push(rssi(0, "late"), now + Duration::from_secs(5));
        queue.push(rssi(0, "early"), now + Duration::from_secs(1));
        assert_eq!(queue.next_expiry(), Some(now + Duration::from_secs(1)));

        let expired = queue.drain_expired(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tag(), Some("early"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_expiry(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_drain_kind() {
        let now = Instant::now();
        let mut queue = RequestQueue::new();
        queue.push(rssi(0, "r"), now);
        queue.push(RequestDescriptor::change_mtu(185), now);
        queue.push(rssi(0, "r2"), now);
        let removed = queue.drain_kind(RequestKind::ReadRssi);
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.pop().map(|r| r.kind()), Some(RequestKind::ChangeMtu));
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_stable_descending(
            priorities in proptest::collection::vec(-5i32..5, 0..40)
        ) {
            let now = Instant::now();
            let mut queue = RequestQueue::new();
            for (arrival, p) in priorities.iter().enumerate() {
                queue.push(rssi(*p, &arrival.to_string()), now);
            }
            let popped: Vec<(i32, usize)> = std::iter::from_fn(|| queue.pop())
                .map(|r| (r.priority(), r.tag().and_then(|t| t.parse().ok()).unwrap_or(usize::MAX)))
                .collect();

            let mut expected: Vec<(i32, usize)> = priorities
                .iter()
                .enumerate()
                .map(|(arrival, p)| (*p, arrival))
                .collect();
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            prop_assert_eq!(popped, expected);
        }
    }
}

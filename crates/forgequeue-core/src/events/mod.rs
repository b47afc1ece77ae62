//! In-process pub/sub used to fan job lifecycle notifications out to
//! whoever is interested: completion waiters, cancellation waiters, and
//! (eventually) external observers wired in by the binary crate.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::jobs::Job;

/// The kinds of events the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobEnqueued,
    JobCompleted,
    JobFailed,
    JobCancelled,
    /// A cancellation request was recorded against a running job; carries
    /// the job id so processors can filter to the job they're running.
    JobCancellationRequested,
}

/// A single notification carried on the bus. `job` carries the terminal row
/// (status + result, per §4.1: "the published event carries the full
/// terminal state") for `JobCompleted`/`JobFailed`/`JobCancelled` — the row
/// is deleted right after publish, so this is the only place a subscriber
/// can observe the outcome (§7).
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub job_id: Uuid,
    pub reason: Option<String>,
    pub job: Option<Job>,
}

impl Event {
    pub fn new(kind: EventKind, job_id: Uuid) -> Self {
        Self {
            kind,
            job_id,
            reason: None,
            job: None,
        }
    }

    pub fn with_reason(kind: EventKind, job_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            kind,
            job_id,
            reason: Some(reason.into()),
            job: None,
        }
    }

    /// A completion/failure/cancellation event carrying the job's terminal
    /// state.
    pub fn terminal(kind: EventKind, job: Job) -> Self {
        Self {
            kind,
            job_id: job.id,
            reason: job.cancel_reason.clone(),
            job: Some(job),
        }
    }
}

pub type SubscriptionId = Uuid;

type Callback = dyn Fn(&Event) + Send + Sync;

/// Broadcast manager for job lifecycle events.
///
/// `publish` clones the current subscriber list for the event's kind
/// (copy-on-iterate, so a subscriber added or removed mid-publish never
/// corrupts the active broadcast) and invokes each callback in
/// registration order, synchronously, on the publisher's call stack.
pub struct EventBus {
    subscriptions: Arc<DashMap<EventKind, Vec<(SubscriptionId, Arc<Callback>)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    /// Register a callback for an event kind. Returns an id that can be
    /// passed to `unsubscribe`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.subscriptions
            .entry(kind)
            .or_insert_with(Vec::new)
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a previously registered subscription.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        if let Some(mut subs) = self.subscriptions.get_mut(&kind) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Publish an event to all current subscribers of its kind.
    pub fn publish(&self, event: Event) {
        let callbacks: Vec<Arc<Callback>> = match self.subscriptions.get(&event.kind) {
            Some(subs) => subs.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        };

        if callbacks.is_empty() {
            return;
        }

        debug!(kind = ?event.kind, job_id = %event.job_id, subscribers = callbacks.len(), "publishing event");

        for callback in callbacks {
            callback(&event);
        }
    }

    /// Subscribe to cancellation requests for a single job id, ignoring
    /// events for any other job.
    pub fn subscribe_to_job_cancellation<F>(&self, job_id: Uuid, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::JobCancellationRequested, move |event| {
            if event.job_id == job_id {
                callback(event);
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_fans_out_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(EventKind::JobCompleted, move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.subscribe(EventKind::JobCompleted, move |_| o2.lock().unwrap().push(2));

        bus.publish(Event::new(EventKind::JobCompleted, Uuid::new_v4()));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(EventKind::JobFailed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::new(EventKind::JobFailed, Uuid::new_v4()));
        bus.unsubscribe(EventKind::JobFailed, id);
        bus.publish(Event::new(EventKind::JobFailed, Uuid::new_v4()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_job_cancellation_filters_by_id() {
        let bus = EventBus::new();
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();

        bus.subscribe_to_job_cancellation(target, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::with_reason(
            EventKind::JobCancellationRequested,
            other,
            "unrelated",
        ));
        assert_eq!(hit.load(Ordering::SeqCst), 0);

        bus.publish(Event::with_reason(
            EventKind::JobCancellationRequested,
            target,
            "user requested",
        ));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}

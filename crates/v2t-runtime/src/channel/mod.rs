//! Per-target event fan-out with snapshot-then-tail subscriptions.
//!
//! Every workspace and branch has a topic holding its sequence counter,
//! its live subscribers and a bounded backlog of recent events. All topics
//! sit behind one lock, and state mutations that emit events run inside
//! [`EventHub::commit`] while that lock is held. A subscriber's snapshot is
//! taken under the same lock, so it reflects exactly the events published
//! before registration and none after: no gap, no duplicate.
//!
//! Delivery never blocks the producer. Each subscriber has a bounded queue;
//! a subscriber whose queue is full is removed on the spot and its stream
//! ends, which the consumer handles by resuming.

mod subscription;

pub use subscription::Subscription;

use std::collections::{HashMap, VecDeque};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use v2t_core::{Event, EventPayload, Snapshot, TargetId};
use v2t_settings::ChannelSettings;

/// Events staged by a [`EventHub::commit`] closure, delivered in push order
/// once the closure returns.
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<(TargetId, EventPayload)>,
}

impl Outbox {
    /// Stage `payload` for `target`.
    pub fn push(&mut self, target: impl Into<TargetId>, payload: EventPayload) {
        self.events.push((target.into(), payload));
    }

    /// Number of staged events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Default)]
struct Topic {
    seq: u64,
    closed: bool,
    subscribers: Vec<mpsc::Sender<Event>>,
    backlog: VecDeque<Event>,
}

impl Topic {
    /// Whether every event after `after_seq` is still in the backlog.
    fn covers(&self, after_seq: u64) -> bool {
        if after_seq > self.seq {
            return false;
        }
        if after_seq == self.seq {
            return true;
        }
        self.backlog
            .front()
            .is_some_and(|first| first.seq <= after_seq + 1)
    }
}

/// The event channel.
pub struct EventHub {
    topics: Mutex<HashMap<TargetId, Topic>>,
    subscriber_buffer: usize,
    backlog: usize,
}

impl EventHub {
    /// Create a hub with the given buffer sizes.
    pub fn new(settings: &ChannelSettings) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            subscriber_buffer: settings.subscriber_buffer.max(1),
            backlog: settings.backlog,
        }
    }

    /// Run `apply` under the channel lock, then publish whatever it staged.
    ///
    /// `apply` must not call back into the hub.
    pub fn commit<R>(&self, apply: impl FnOnce(&mut Outbox) -> R) -> R {
        let mut topics = self.topics.lock();
        let mut outbox = Outbox::default();
        let result = apply(&mut outbox);
        for (target, payload) in outbox.events {
            let _ = self.deliver(&mut topics, target, payload);
        }
        result
    }

    /// Publish a single event. Returns its sequence number.
    pub fn publish(&self, target: impl Into<TargetId>, payload: EventPayload) -> u64 {
        let target = target.into();
        let mut topics = self.topics.lock();
        self.deliver(&mut topics, target, payload)
    }

    fn deliver(
        &self,
        topics: &mut HashMap<TargetId, Topic>,
        target: TargetId,
        payload: EventPayload,
    ) -> u64 {
        let topic = topics.entry(target.clone()).or_default();
        topic.seq += 1;
        if payload.reopens(&target) {
            topic.closed = false;
        }
        let event = Event::new(target, topic.seq, payload);
        let closing = event.is_closing();

        if self.backlog > 0 {
            if topic.backlog.len() == self.backlog {
                let _ = topic.backlog.pop_front();
            }
            topic.backlog.push_back(event.clone());
        }

        if !topic.closed {
            topic.subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    counter!("v2t_channel_subscribers_dropped_total").increment(1);
                    warn!(topic = %event.target, seq = event.seq, "dropping slow subscriber");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(topic = %event.target, "subscriber disconnected");
                    false
                }
            });
        }
        counter!("v2t_events_published_total", "type" => event.payload.type_name()).increment(1);

        if closing {
            topic.closed = true;
            // Dropping the senders ends each stream after its queued events.
            topic.subscribers.clear();
        }
        event.seq
    }

    /// Subscribe with snapshot-then-tail.
    ///
    /// `snapshot` reads the target's current state; `None` means the target
    /// does not exist and no subscription is created. A terminal target
    /// yields a stream holding only the snapshot.
    pub fn subscribe(
        &self,
        target: impl Into<TargetId>,
        snapshot: impl FnOnce() -> Option<Snapshot>,
    ) -> Option<Subscription> {
        let target = target.into();
        let mut topics = self.topics.lock();
        self.subscribe_locked(&mut topics, target, snapshot)
    }

    fn subscribe_locked(
        &self,
        topics: &mut HashMap<TargetId, Topic>,
        target: TargetId,
        snapshot: impl FnOnce() -> Option<Snapshot>,
    ) -> Option<Subscription> {
        let snapshot = snapshot()?;
        let terminal = snapshot.is_terminal();
        let topic = topics.entry(target.clone()).or_default();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let first = Event::new(target, topic.seq, EventPayload::Snapshot { snapshot });
        // Capacity is at least one, so the first send on a fresh queue succeeds.
        let _ = tx.try_send(first);
        if !terminal {
            topic.closed = false;
            topic.subscribers.push(tx);
        }
        Some(Subscription::new(rx))
    }

    /// Resume after the last event a consumer saw.
    ///
    /// When the backlog still holds every event after `after_seq` they are
    /// replayed and the live tail follows. Otherwise this falls back to
    /// [`subscribe`](Self::subscribe).
    pub fn resume(
        &self,
        target: impl Into<TargetId>,
        after_seq: u64,
        snapshot: impl FnOnce() -> Option<Snapshot>,
    ) -> Option<Subscription> {
        let target = target.into();
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get_mut(&target).filter(|t| t.covers(after_seq)) {
            let replay: Vec<Event> = topic
                .backlog
                .iter()
                .filter(|e| e.seq > after_seq)
                .cloned()
                .collect();
            let (tx, rx) = mpsc::channel(self.subscriber_buffer.max(replay.len() + 1));
            debug!(topic = %target, after_seq, replayed = replay.len(), "resuming from backlog");
            for event in replay {
                let _ = tx.try_send(event);
            }
            if !topic.closed {
                topic.subscribers.push(tx);
            }
            return Some(Subscription::new(rx));
        }
        debug!(topic = %target, after_seq, "backlog does not cover gap, sending snapshot");
        self.subscribe_locked(&mut topics, target, snapshot)
    }

    /// Sequence number of the last event published to `target`.
    pub fn last_seq(&self, target: &TargetId) -> u64 {
        self.topics.lock().get(target).map_or(0, |t| t.seq)
    }

    /// Number of live subscribers on `target`.
    pub fn subscriber_count(&self, target: &TargetId) -> usize {
        self.topics
            .lock()
            .get(target)
            .map_or(0, |t| t.subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Run `select` under the channel lock and drop the topics it returns,
    /// ending their subscriptions. Nothing can publish or subscribe between
    /// the selection and the removal.
    pub fn remove_with(&self, select: impl FnOnce() -> Vec<TargetId>) {
        let mut topics = self.topics.lock();
        for target in select() {
            let _ = topics.remove(&target);
        }
    }

    /// End every subscription.
    pub fn close_all(&self) {
        let mut topics = self.topics.lock();
        for topic in topics.values_mut() {
            topic.closed = true;
            topic.subscribers.clear();
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field("backlog", &self.backlog)
            .finish_non_exhaustive()
    }
}

//! In-process publish/subscribe for mutation lifecycle events.
//!
//! Delivery is synchronous on the publisher and best-effort: handlers must
//! not block, and a handler that needs to do real work should hand the event
//! off to its own queue. Within one topic, handlers see events in publish
//! order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{BlockCoord, InstanceId, Label, LabelSet, MutationId, VersionId};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Topic {
    MergeStart,
    MergeBlock,
    MergeEnd,
    SplitStart,
    SplitBlock,
    SplitLabel,
    SplitEnd,
    ChangeSize,
    BlockChanged,
}

#[derive(Clone, Debug)]
pub enum Event {
    MergeStart {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        target: Label,
        merged: LabelSet,
    },
    MergeBlock {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        target: Label,
        merged: LabelSet,
        blocks: Vec<BlockCoord>,
    },
    MergeEnd {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        target: Label,
        merged: LabelSet,
    },
    SplitStart {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        old_label: Label,
        new_label: Label,
    },
    SplitBlock {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        old_label: Label,
        new_label: Label,
        block: BlockCoord,
    },
    SplitLabel {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        old_label: Label,
        new_label: Label,
        blocks: Vec<BlockCoord>,
    },
    SplitEnd {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        old_label: Label,
        new_label: Label,
    },
    ChangeSize {
        instance: InstanceId,
        version: VersionId,
        label: Label,
        old_voxels: u64,
        new_voxels: u64,
    },
    BlockChanged {
        instance: InstanceId,
        version: VersionId,
        mutation: MutationId,
        block: BlockCoord,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::MergeStart { .. } => Topic::MergeStart,
            Event::MergeBlock { .. } => Topic::MergeBlock,
            Event::MergeEnd { .. } => Topic::MergeEnd,
            Event::SplitStart { .. } => Topic::SplitStart,
            Event::SplitBlock { .. } => Topic::SplitBlock,
            Event::SplitLabel { .. } => Topic::SplitLabel,
            Event::SplitEnd { .. } => Topic::SplitEnd,
            Event::ChangeSize { .. } => Topic::ChangeSize,
            Event::BlockChanged { .. } => Topic::BlockChanged,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(topic)
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock();
        for handlers in subs.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sid, _)| *sid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Invokes every handler of the event's topic. Handlers run outside the
    /// registry lock so a handler may subscribe or unsubscribe.
    pub fn publish(&self, event: &Event) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock();
            match subs.get(&event.topic()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn change_size(label: Label) -> Event {
        Event::ChangeSize {
            instance: InstanceId(1),
            version: VersionId(1),
            label,
            old_voxels: 0,
            new_voxels: 1,
        }
    }

    #[test]
    fn delivery_is_fifo_within_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Topic::ChangeSize,
            Arc::new(move |event| {
                if let Event::ChangeSize { label, .. } = event {
                    sink.lock().push(*label);
                }
            }),
        );
        for label in 1..=5 {
            bus.publish(&change_size(label));
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bus.subscribe(
            Topic::ChangeSize,
            Arc::new(move |event| {
                if let Event::ChangeSize { label, .. } = event {
                    sink.lock().push(*label);
                }
            }),
        );
        bus.publish(&change_size(1));
        assert!(bus.unsubscribe(id));
        bus.publish(&change_size(2));
        assert!(!bus.unsubscribe(id));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn topics_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(0usize));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Topic::MergeStart,
            Arc::new(move |_| {
                *sink.lock() += 1;
            }),
        );
        bus.publish(&change_size(1));
        assert_eq!(*seen.lock(), 0);
    }
}

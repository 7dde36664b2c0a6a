use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use uuid::Uuid;

use super::Frame;

/// What a full consumer queue does with the next published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame so the consumer always sees the freshest one.
    /// Used by the inference consumer.
    DropOldest,
    /// Discard the incoming frame. Used by streaming viewers.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(Uuid);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub label: String,
    pub policy: OverflowPolicy,
    pub capacity: usize,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

struct Slot {
    label: String,
    policy: OverflowPolicy,
    tx: Sender<Frame>,
    // Kept so a drop-oldest slot can evict from its own queue.
    evict_rx: Receiver<Frame>,
    counters: Arc<Counters>,
}

impl Slot {
    fn offer(&self, frame: Frame) {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(frame)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if self.policy == OverflowPolicy::DropOldest {
                    let _ = self.evict_rx.try_recv();
                    if self.tx.try_send(frame).is_ok() {
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Fans every captured frame out to a dynamic set of bounded consumer queues.
///
/// `publish` never waits on a consumer: a full queue loses a frame according
/// to its [`OverflowPolicy`] and capture carries on.
pub struct FrameBroadcaster {
    consumers: Mutex<HashMap<ConsumerId, Slot>>,
    published: AtomicU64,
}

impl FrameBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            consumers: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
        })
    }

    fn consumers(&self) -> MutexGuard<'_, HashMap<ConsumerId, Slot>> {
        match self.consumers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a new consumer. It is detached when dropped or via [`FrameConsumer::detach`].
    pub fn attach(
        self: &Arc<Self>,
        label: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> FrameConsumer {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let id = ConsumerId(Uuid::new_v4());
        let label = label.into();
        let counters = Arc::new(Counters::default());

        self.consumers().insert(
            id,
            Slot {
                label: label.clone(),
                policy,
                tx,
                evict_rx: rx.clone(),
                counters: Arc::clone(&counters),
            },
        );
        log::debug!("frame consumer {label} attached ({id}, capacity {capacity}, {policy:?})");

        FrameConsumer {
            id,
            label,
            capacity,
            rx,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Removes a consumer. Unknown ids are ignored.
    pub fn detach(&self, id: ConsumerId) -> bool {
        let removed = self.consumers().remove(&id);
        if let Some(slot) = &removed {
            log::debug!("frame consumer {} detached ({id})", slot.label);
        }
        removed.is_some()
    }

    pub fn publish(&self, frame: Frame) {
        self.published.fetch_add(1, Ordering::Relaxed);
        for slot in self.consumers().values() {
            slot.offer(frame.clone());
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers().len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<ConsumerStats> {
        self.consumers()
            .values()
            .map(|slot| ConsumerStats {
                label: slot.label.clone(),
                policy: slot.policy,
                capacity: slot.tx.capacity().unwrap_or_default(),
                queued: slot.tx.len(),
                delivered: slot.counters.delivered.load(Ordering::Relaxed),
                dropped: slot.counters.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn total_dropped(&self) -> u64 {
        self.consumers()
            .values()
            .map(|slot| slot.counters.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

/// Independently-paced reader of the broadcast stream.
pub struct FrameConsumer {
    id: ConsumerId,
    label: String,
    capacity: usize,
    rx: Receiver<Frame>,
    broadcaster: Weak<FrameBroadcaster>,
}

impl FrameConsumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits up to `timeout` for the next frame. `None` means no data yet,
    /// which callers treat as a normal condition rather than an error.
    pub fn receive(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Detached: keep the bounded-wait contract instead of spinning.
                std::thread::sleep(timeout);
                None
            }
        }
    }

    pub fn try_receive(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn is_attached(&self) -> bool {
        self.broadcaster
            .upgrade()
            .map(|b| b.consumers().contains_key(&self.id))
            .unwrap_or(false)
    }

    /// Unregisters from the broadcaster. Safe to call more than once.
    pub fn detach(&self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.detach(self.id);
        }
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.detach();
    }
}

//! [`Topic`] – fixed-capacity message ring shared by publishers and
//! subscribers.
//!
//! Message slots are allocated once, at topic creation, in an arena and
//! linked by index.  The write cursor (`latest`) points at the newest
//! message; the slot after it is the oldest message and the next one to be
//! overwritten.
//!
//! | Order | Placement of a new message |
//! |---|---|
//! | [`MessageOrder::PubTime`] | Always at the slot after the cursor, which then advances. |
//! | [`MessageOrder::MsgTime`] | At the cursor if its timestamp is the newest; otherwise the oldest slot is unlinked and re-linked behind the last message not newer than it. |
//!
//! Every slot carries a countdown of hard real-time (HRT) subscribers that
//! still have to consume it.  A slot with a non-zero countdown is only reused
//! by an enforcing publish.
//!
//! The topic also owns the QoS bookkeeping of its HRT subscribers: a rate
//! timer watching the most critical subscriber and one deadline/jitter timer
//! per subscriber.  All of it lives in [`TopicState`] behind the topic lock,
//! so nothing can touch the ring, the cursor or the subscriber list without
//! holding it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rtbus_kernel::{EventSource, QosTimer, TimerCallback};
use rtbus_types::{
    BusError, BusResult, MessageId, MessageOrder, QosContract, Timestamp, TopicId, TopicStats,
};
use tracing::{debug, warn};

use crate::core::Core;
use crate::qos::{LatencyWindow, Recovery, critical_delay};

// ────────────────────────────────────────────────────────────────────────────
// Arena
// ────────────────────────────────────────────────────────────────────────────

pub(crate) struct Slot {
    pub(crate) id: MessageId,
    pub(crate) time: Timestamp,
    pub(crate) payload: Box<[u8]>,
    pub(crate) size: usize,
    /// HRT subscribers that still have to consume this message.
    pub(crate) hrt_left: usize,
    pub(crate) next: usize,
    pub(crate) utilizations: u64,
    /// Subscribers of any class that have not consumed this message.
    pub(crate) consumers_left: usize,
}

/// Message a deadline timer currently protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QosMark {
    pub(crate) slot: usize,
    pub(crate) id: MessageId,
    pub(crate) time: Timestamp,
}

pub(crate) struct HrtEntry {
    pub(crate) key: u64,
    pub(crate) contract: QosContract,
    pub(crate) window: LatencyWindow,
    pub(crate) timer: QosTimer,
    pub(crate) mark: Option<QosMark>,
    pub(crate) armed_at: Option<Timestamp>,
    pub(crate) recovery: Recovery,
    pub(crate) violation: Option<BusError>,
}

impl HrtEntry {
    fn rate_key(&self) -> Duration {
        self.contract.rate.unwrap_or(Duration::MAX)
    }

    pub(crate) fn disarm(&mut self) {
        self.timer.reset();
        self.mark = None;
        self.armed_at = None;
    }
}

pub(crate) struct TopicState {
    pub(crate) slots: Vec<Slot>,
    pub(crate) latest: usize,
    /// Timestamp of the newest information published so far.
    pub(crate) newest_information: Option<Timestamp>,
    pub(crate) message_counter: MessageId,
    /// Sorted by expected rate, tightest first; subscribers without a rate
    /// come last.
    pub(crate) hrt: Vec<HrtEntry>,
    pub(crate) next_key: u64,
    pub(crate) rate_deadline: Option<Timestamp>,
    pub(crate) subscribers: usize,
    pub(crate) published: u64,
    pub(crate) discarded: u64,
}

impl TopicState {
    /// Slot after the cursor: the oldest message and the next one to reuse.
    pub(crate) fn oldest(&self) -> usize {
        self.slots[self.latest].next
    }

    fn oldest_valid(&self) -> usize {
        let mut idx = self.oldest();
        while !self.slots[idx].id.is_valid() && idx != self.latest {
            idx = self.slots[idx].next;
        }
        idx
    }

    /// First message a reader that last consumed `(last, last_id)` has not
    /// seen yet, or `None` if it is up to date.  A reader whose last message
    /// was overwritten resumes at the oldest one.
    pub(crate) fn resume_from(&self, last: usize, last_id: MessageId) -> Option<usize> {
        if self.slots[last].id == last_id {
            (last != self.latest).then(|| self.slots[last].next)
        } else {
            Some(self.oldest_valid())
        }
    }

    /// Slot indices from `from` to the cursor, inclusive.
    pub(crate) fn chain(&self, from: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut idx = from;
        for _ in 0..self.slots.len() {
            out.push(idx);
            if idx == self.latest {
                break;
            }
            idx = self.slots[idx].next;
        }
        out
    }

    pub(crate) fn hrt_position(&self, key: u64) -> Option<usize> {
        self.hrt.iter().position(|e| e.key == key)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Topic
// ────────────────────────────────────────────────────────────────────────────

pub(crate) struct TopicInner {
    pub(crate) id: TopicId,
    pub(crate) core: Arc<Core>,
    pub(crate) order: MessageOrder,
    pub(crate) payload_capacity: usize,
    pub(crate) state: Mutex<TopicState>,
    /// Signalled when a slot's HRT countdown reaches zero.
    pub(crate) released: Condvar,
    pub(crate) events: EventSource,
    rate_timer: QosTimer,
}

/// Handle to a topic.  Cloning yields another handle to the same ring.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rtbus_kernel::ManualClock;
/// use rtbus_middleware::{Core, Publisher, Topic};
/// use rtbus_types::{BusConfig, PublishPolicy, Timestamp};
///
/// let core = Core::new(BusConfig::default(), Arc::new(ManualClock::default()));
/// let topic = Topic::new(&core, 1, 4, 8).unwrap();
/// let publisher = Publisher::new(&topic);
///
/// publisher
///     .publish(b"odometry", Timestamp::from_millis(1), PublishPolicy::Blocking, None)
///     .unwrap();
/// assert_eq!(topic.messages().len(), 1);
/// ```
#[derive(Clone)]
pub struct Topic {
    pub(crate) inner: Arc<TopicInner>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.inner.id)
            .field("order", &self.inner.order)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Topic {
    /// Create a topic with `capacity` message slots of `payload_capacity`
    /// bytes each.  The message order is taken from the core configuration.
    pub fn new(core: &Arc<Core>, id: TopicId, capacity: usize, payload_capacity: usize) -> BusResult<Self> {
        if capacity == 0 {
            return Err(BusError::InvalidConfig(format!(
                "topic {id} needs at least one message slot"
            )));
        }
        let slots = (0..capacity)
            .map(|i| Slot {
                id: MessageId::INVALID,
                time: Timestamp::ZERO,
                payload: vec![0; payload_capacity].into_boxed_slice(),
                size: 0,
                hrt_left: 0,
                next: (i + 1) % capacity,
                utilizations: 0,
                consumers_left: 0,
            })
            .collect();
        let order = core.config().message_order;
        debug!(topic = id, capacity, payload_capacity, ?order, "topic created");
        Ok(Self {
            inner: Arc::new(TopicInner {
                id,
                core: Arc::clone(core),
                order,
                payload_capacity,
                state: Mutex::new(TopicState {
                    slots,
                    latest: capacity - 1,
                    newest_information: None,
                    message_counter: MessageId::INVALID,
                    hrt: Vec::new(),
                    next_key: 0,
                    rate_deadline: None,
                    subscribers: 0,
                    published: 0,
                    discarded: 0,
                }),
                released: Condvar::new(),
                events: EventSource::new(),
                rate_timer: core.timers().timer(),
            }),
        })
    }

    pub fn id(&self) -> TopicId {
        self.inner.id
    }

    pub fn order(&self) -> MessageOrder {
        self.inner.order
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn payload_capacity(&self) -> usize {
        self.inner.payload_capacity
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    /// Broadcast (with flags `0`) after every successful publish.
    pub fn event_source(&self) -> &EventSource {
        &self.inner.events
    }

    /// Buffered messages, oldest first.
    pub fn messages(&self) -> Vec<(MessageId, Timestamp)> {
        let state = self.inner.state.lock();
        state
            .chain(state.oldest())
            .into_iter()
            .map(|idx| &state.slots[idx])
            .filter(|slot| slot.id.is_valid())
            .map(|slot| (slot.id, slot.time))
            .collect()
    }

    /// Newest message, if any.
    pub fn latest(&self) -> Option<(MessageId, Timestamp)> {
        let state = self.inner.state.lock();
        let slot = &state.slots[state.latest];
        slot.id.is_valid().then_some((slot.id, slot.time))
    }

    pub fn hrt_subscriber_count(&self) -> usize {
        self.inner.state.lock().hrt.len()
    }

    /// Deadline the topic rate timer is armed for.
    pub fn rate_deadline(&self) -> Option<Timestamp> {
        self.inner.rate_timer.deadline()
    }

    pub fn stats(&self) -> TopicStats {
        let state = self.inner.state.lock();
        TopicStats {
            id: self.inner.id,
            capacity: state.slots.len(),
            subscribers: state.subscribers,
            hrt_subscribers: state.hrt.len(),
            published: state.published,
            discarded: state.discarded,
            utilizations: state.slots.iter().map(|s| s.utilizations).collect(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// QoS timers
// ────────────────────────────────────────────────────────────────────────────

impl TopicInner {
    /// Deadline and jitter bounds of `contract` that the configuration arms.
    pub(crate) fn monitored(&self, contract: &QosContract) -> (Option<Duration>, Option<Duration>) {
        let checks = &self.core.config().pubsub_qos;
        (
            contract.deadline.filter(|_| checks.deadline),
            contract.jitter.filter(|_| checks.jitter),
        )
    }

    pub(crate) fn deadline_checks_enabled(&self) -> bool {
        let checks = &self.core.config().pubsub_qos;
        checks.deadline || checks.jitter
    }

    /// Register an HRT subscriber and return its key.
    pub(crate) fn add_hrt(&self, state: &mut TopicState, contract: QosContract, recovery: Recovery) -> u64 {
        state.next_key += 1;
        let entry = HrtEntry {
            key: state.next_key,
            contract,
            window: LatencyWindow::default(),
            timer: self.core.timers().timer(),
            mark: None,
            armed_at: None,
            recovery,
            violation: None,
        };
        let at = state
            .hrt
            .iter()
            .position(|e| e.rate_key() > entry.rate_key())
            .unwrap_or(state.hrt.len());
        state.hrt.insert(at, entry);
        state.next_key
    }

    /// Arm the rate timer for the first subscriber at or after `from` that
    /// declares a rate, relative to the newest information.
    pub(crate) fn arm_rate_timer(self: &Arc<Self>, state: &mut TopicState, from: usize) {
        let target = match state.newest_information {
            Some(base) if self.core.config().pubsub_qos.rate => state
                .hrt
                .iter()
                .skip(from)
                .find_map(|e| e.contract.rate.map(|rate| (e.key, base + rate))),
            _ => None,
        };
        match target {
            Some((key, at)) => {
                state.rate_deadline = Some(at);
                self.rate_timer.arm(at, self.rate_callback(key));
            }
            None => {
                state.rate_deadline = None;
                self.rate_timer.reset();
            }
        }
    }

    fn rate_callback(self: &Arc<Self>, key: u64) -> TimerCallback {
        let topic: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(topic) = topic.upgrade() {
                topic.on_rate_expired(key);
            }
        })
    }

    fn on_rate_expired(self: &Arc<Self>, key: u64) {
        let now = self.core.now();
        let escalation = {
            let mut state = self.state.lock();
            match state.rate_deadline {
                Some(at) if at <= now => {}
                _ => return,
            }
            let Some(pos) = state.hrt_position(key) else {
                return;
            };
            warn!(topic = self.id, subscriber = key, "rate violation");
            let st = &mut *state;
            let entry = &mut st.hrt[pos];
            let recoverable = matches!(entry.recovery, Recovery::Handler(_));
            let escalation = entry
                .recovery
                .escalate(&mut entry.violation, BusError::RateViolation);
            if recoverable {
                // Hand the watch over to the next subscriber in line.
                self.arm_rate_timer(st, pos + 1);
            } else {
                st.rate_deadline = None;
            }
            escalation
        };
        escalation.run(&self.core);
    }

    /// Arm `entry`'s deadline timer for the message described by `mark`.
    /// Returns `false` if the entry has nothing to monitor.
    pub(crate) fn arm_deadline(self: &Arc<Self>, entry: &mut HrtEntry, mark: QosMark) -> bool {
        let (deadline, jitter) = self.monitored(&entry.contract);
        let Some((delay, _)) = critical_delay(deadline, jitter, &entry.window) else {
            return false;
        };
        let at = mark.time + delay;
        entry.mark = Some(mark);
        entry.armed_at = Some(at);
        entry.timer.arm(at, self.deadline_callback(entry.key));
        true
    }

    fn deadline_callback(self: &Arc<Self>, key: u64) -> TimerCallback {
        let topic: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(topic) = topic.upgrade() {
                topic.on_deadline_expired(key);
            }
        })
    }

    fn on_deadline_expired(self: &Arc<Self>, key: u64) {
        let now = self.core.now();
        let escalation = {
            let mut state = self.state.lock();
            let Some(pos) = state.hrt_position(key) else {
                return;
            };
            let entry = &mut state.hrt[pos];
            match entry.armed_at {
                Some(at) if at <= now => {}
                _ => return,
            }
            entry.armed_at = None;
            let (deadline, jitter) = self.monitored(&entry.contract);
            let violation = critical_delay(deadline, jitter, &entry.window)
                .map(|(_, violation)| violation)
                .unwrap_or(BusError::DeadlineViolation);
            warn!(topic = self.id, subscriber = key, %violation, "message not consumed in time");
            entry.recovery.escalate(&mut entry.violation, violation)
        };
        escalation.run(&self.core);
    }
}

//! Reading ends of a [`Topic`], one type per real-time class.
//!
//! | Type | Contract | Extra on fetch |
//! |---|---|---|
//! | [`NrtSubscriber`] | none | none |
//! | [`SrtSubscriber`] | usefulness function | [`SrtSubscriber::usefulness`] rates a latency in `[0, 1]` |
//! | [`FrtSubscriber`] | deadline, jitter | late or jittery messages are reported in [`Fetched::violation`] |
//! | [`HrtSubscriber`] | [`QosContract`] + [`Recovery`] | mandatory consumption: blocks slot reuse, moves the deadline timer, escalates jitter violations |
//!
//! All of them share the same cursor logic: `fetch_next` returns the message
//! after the last one read, or the oldest buffered one if that was
//! overwritten in the meantime; `fetch_latest` jumps to the newest message and
//! counts everything in between as consumed.
//!
//! Subscribing registers the calling thread's signal on the topic's event
//! source with the given mask.  Dropping a subscriber unsubscribes it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rtbus_kernel::{EventListener, current_signal};
use rtbus_types::{
    BusError, BusResult, EventMask, LatencyStats, MessageId, MessageOrder, QosContract, RtClass,
    SubscriberStats, Timestamp,
};
use tracing::debug;

use crate::qos::{Escalation, LatencyWindow, Recovery};
use crate::topic::{HrtEntry, QosMark, Topic, TopicInner, TopicState};

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Bytes copied into the caller's buffer.
    pub size: usize,
    /// Timestamp of the fetched message.
    pub time: Timestamp,
    /// Time between the message timestamp and the fetch.
    pub latency: Duration,
    /// Contract violation detected on this fetch, if any.
    pub violation: Option<BusError>,
}

/// Operations common to every subscriber class.
pub trait Subscriber {
    fn class(&self) -> RtClass;

    fn topic(&self) -> &Topic;

    /// Registration on the topic's event source.
    fn listener(&self) -> &EventListener;

    /// Copy the next unread message into `buf`.
    fn fetch_next(&mut self, buf: &mut [u8]) -> BusResult<Fetched>;

    /// Copy the newest message into `buf`, skipping everything unread.
    fn fetch_latest(&mut self, buf: &mut [u8]) -> BusResult<Fetched>;

    fn stats(&self) -> SubscriberStats;
}

// ────────────────────────────────────────────────────────────────────────────
// Shared cursor
// ────────────────────────────────────────────────────────────────────────────

struct Reader {
    topic: Topic,
    last: usize,
    last_id: MessageId,
    listener: EventListener,
    received: u64,
    latency: LatencyStats,
}

impl Reader {
    /// Start reading after the current latest message.
    fn attach(topic: &Topic, state: &mut TopicState, mask: EventMask) -> Self {
        state.subscribers += 1;
        Self {
            topic: topic.clone(),
            last: state.latest,
            last_id: state.slots[state.latest].id,
            listener: topic.inner.events.register(current_signal(), mask),
            received: 0,
            latency: LatencyStats::default(),
        }
    }

    fn subscribe(topic: &Topic, mask: EventMask) -> Self {
        let mut state = topic.inner.state.lock();
        Self::attach(topic, &mut state, mask)
    }

    fn inner(&self) -> Arc<TopicInner> {
        Arc::clone(&self.topic.inner)
    }

    /// Copy slot `idx` into `buf` and move the cursor onto it.
    fn take(&mut self, state: &TopicState, idx: usize, buf: &mut [u8]) -> BusResult<(usize, Timestamp)> {
        let slot = &state.slots[idx];
        if slot.size > buf.len() {
            return Err(BusError::PayloadTooLarge {
                size: slot.size,
                capacity: buf.len(),
            });
        }
        buf[..slot.size].copy_from_slice(&slot.payload[..slot.size]);
        self.last = idx;
        self.last_id = slot.id;
        Ok((slot.size, slot.time))
    }

    fn track(&mut self, consumed: usize, latency: Duration) {
        self.received += consumed as u64;
        self.latency.record(latency);
    }

    fn fetch_next(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        let inner = self.inner();
        let mut state = inner.state.lock();
        let idx = state
            .resume_from(self.last, self.last_id)
            .ok_or(BusError::FetchNoMessage)?;
        let (size, time) = self.take(&state, idx, buf)?;
        let slot = &mut state.slots[idx];
        slot.consumers_left = slot.consumers_left.saturating_sub(1);
        let latency = inner.core.now().saturating_duration_since(time);
        drop(state);

        self.track(1, latency);
        Ok(Fetched {
            size,
            time,
            latency,
            violation: None,
        })
    }

    fn fetch_latest(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        let inner = self.inner();
        let mut state = inner.state.lock();
        let start = state
            .resume_from(self.last, self.last_id)
            .ok_or(BusError::FetchNoMessage)?;
        let latest = state.latest;
        let (size, time) = self.take(&state, latest, buf)?;
        let skipped = state.chain(start);
        for &idx in &skipped {
            let slot = &mut state.slots[idx];
            slot.consumers_left = slot.consumers_left.saturating_sub(1);
        }
        let latency = inner.core.now().saturating_duration_since(time);
        drop(state);

        self.track(skipped.len(), latency);
        Ok(Fetched {
            size,
            time,
            latency,
            violation: None,
        })
    }

    /// Give up every unread message and leave the topic.
    fn release(&mut self) {
        let inner = self.inner();
        let mut state = inner.state.lock();
        if let Some(start) = state.resume_from(self.last, self.last_id) {
            for idx in state.chain(start) {
                let slot = &mut state.slots[idx];
                slot.consumers_left = slot.consumers_left.saturating_sub(1);
            }
        }
        state.subscribers = state.subscribers.saturating_sub(1);
    }

    fn stats(&self, class: RtClass) -> SubscriberStats {
        SubscriberStats {
            class,
            received: self.received,
            latency: self.latency.clone(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// NRT
// ────────────────────────────────────────────────────────────────────────────

/// Best-effort subscriber.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rtbus_kernel::ManualClock;
/// use rtbus_middleware::{Core, NrtSubscriber, Publisher, Subscriber, Topic};
/// use rtbus_types::{BusConfig, BusError, PublishPolicy, Timestamp};
///
/// let core = Core::new(BusConfig::default(), Arc::new(ManualClock::default()));
/// let topic = Topic::new(&core, 7, 4, 4).unwrap();
/// let mut subscriber = NrtSubscriber::subscribe(&topic, 1);
///
/// Publisher::new(&topic)
///     .publish(b"ping", Timestamp::from_micros(1), PublishPolicy::Blocking, None)
///     .unwrap();
///
/// let mut buf = [0u8; 4];
/// let fetched = subscriber.fetch_next(&mut buf).unwrap();
/// assert_eq!(&buf[..fetched.size], b"ping");
/// assert_eq!(subscriber.fetch_next(&mut buf), Err(BusError::FetchNoMessage));
/// ```
pub struct NrtSubscriber {
    reader: Reader,
}

impl NrtSubscriber {
    pub fn subscribe(topic: &Topic, mask: EventMask) -> Self {
        Self {
            reader: Reader::subscribe(topic, mask),
        }
    }

    pub fn unsubscribe(self) {}
}

impl Subscriber for NrtSubscriber {
    fn class(&self) -> RtClass {
        RtClass::Nrt
    }

    fn topic(&self) -> &Topic {
        &self.reader.topic
    }

    fn listener(&self) -> &EventListener {
        &self.reader.listener
    }

    fn fetch_next(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        self.reader.fetch_next(buf)
    }

    fn fetch_latest(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        self.reader.fetch_latest(buf)
    }

    fn stats(&self) -> SubscriberStats {
        self.reader.stats(RtClass::Nrt)
    }
}

impl Drop for NrtSubscriber {
    fn drop(&mut self) {
        self.reader.release();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SRT
// ────────────────────────────────────────────────────────────────────────────

/// Maps a latency to how useful a message still is.
pub type Usefulness = Arc<dyn Fn(Duration) -> f32 + Send + Sync>;

/// Soft real-time subscriber.
pub struct SrtSubscriber {
    reader: Reader,
    usefulness: Usefulness,
}

impl SrtSubscriber {
    pub fn subscribe(
        topic: &Topic,
        mask: EventMask,
        usefulness: impl Fn(Duration) -> f32 + Send + Sync + 'static,
    ) -> Self {
        Self {
            reader: Reader::subscribe(topic, mask),
            usefulness: Arc::new(usefulness),
        }
    }

    /// Usefulness of a message fetched with `latency`, clamped to `[0, 1]`.
    pub fn usefulness(&self, latency: Duration) -> f32 {
        let value = (self.usefulness)(latency);
        if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
    }

    pub fn unsubscribe(self) {}
}

impl Subscriber for SrtSubscriber {
    fn class(&self) -> RtClass {
        RtClass::Srt
    }

    fn topic(&self) -> &Topic {
        &self.reader.topic
    }

    fn listener(&self) -> &EventListener {
        &self.reader.listener
    }

    fn fetch_next(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        self.reader.fetch_next(buf)
    }

    fn fetch_latest(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        self.reader.fetch_latest(buf)
    }

    fn stats(&self) -> SubscriberStats {
        self.reader.stats(RtClass::Srt)
    }
}

impl Drop for SrtSubscriber {
    fn drop(&mut self) {
        self.reader.release();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FRT
// ────────────────────────────────────────────────────────────────────────────

/// Firm real-time subscriber.
///
/// Late messages are still delivered; the violation is reported with the
/// fetch and does not escalate.
pub struct FrtSubscriber {
    reader: Reader,
    contract: QosContract,
    window: LatencyWindow,
}

impl FrtSubscriber {
    pub fn subscribe(
        topic: &Topic,
        mask: EventMask,
        deadline: Option<Duration>,
        jitter: Option<Duration>,
    ) -> Self {
        Self {
            reader: Reader::subscribe(topic, mask),
            contract: QosContract {
                deadline,
                jitter,
                rate: None,
            },
            window: LatencyWindow::default(),
        }
    }

    /// `true` if a message with `latency` would satisfy the contract,
    /// without recording it.
    pub fn calculate_validity(&self, latency: Duration) -> bool {
        let (deadline, jitter) = self.reader.topic.inner.monitored(&self.contract);
        if deadline.is_some_and(|deadline| latency > deadline) {
            return false;
        }
        !jitter.is_some_and(|jitter| self.window.exceeds(latency, jitter))
    }

    pub fn unsubscribe(self) {}

    fn check(&mut self, mut fetched: Fetched) -> Fetched {
        let (deadline, jitter) = self.reader.topic.inner.monitored(&self.contract);
        fetched.violation = if deadline.is_some_and(|deadline| fetched.latency > deadline) {
            Some(BusError::DeadlineViolation)
        } else if jitter.is_some_and(|jitter| !self.window.record(fetched.latency, jitter)) {
            Some(BusError::JitterViolation)
        } else {
            None
        };
        fetched
    }
}

impl Subscriber for FrtSubscriber {
    fn class(&self) -> RtClass {
        RtClass::Frt
    }

    fn topic(&self) -> &Topic {
        &self.reader.topic
    }

    fn listener(&self) -> &EventListener {
        &self.reader.listener
    }

    fn fetch_next(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        let fetched = self.reader.fetch_next(buf)?;
        Ok(self.check(fetched))
    }

    fn fetch_latest(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        let fetched = self.reader.fetch_latest(buf)?;
        Ok(self.check(fetched))
    }

    fn stats(&self) -> SubscriberStats {
        self.reader.stats(RtClass::Frt)
    }
}

impl Drop for FrtSubscriber {
    fn drop(&mut self) {
        self.reader.release();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HRT
// ────────────────────────────────────────────────────────────────────────────

/// Hard real-time subscriber.
///
/// Every message published while it is subscribed must be consumed by it
/// before the slot can be reused by a non-enforcing publish.  Its contract is
/// watched by the topic's QoS timers; a violation calls [`Core::panic`]
/// unless a [`Recovery::Handler`] is given.
///
/// [`Core::panic`]: crate::core::Core::panic
pub struct HrtSubscriber {
    reader: Reader,
    key: u64,
}

impl fmt::Debug for HrtSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrtSubscriber")
            .field("topic", &self.reader.topic.id())
            .field("key", &self.key)
            .finish()
    }
}

impl HrtSubscriber {
    pub fn subscribe(topic: &Topic, mask: EventMask, contract: QosContract, recovery: Recovery) -> Self {
        let inner = &topic.inner;
        let mut state = inner.state.lock();
        let key = inner.add_hrt(&mut state, contract, recovery);
        let reader = Reader::attach(topic, &mut state, mask);
        drop(state);
        debug!(topic = topic.id(), subscriber = key, ?contract, "hard real-time subscriber joined");
        Self { reader, key }
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut HrtEntry) -> R) -> Option<R> {
        let mut state = self.reader.topic.inner.state.lock();
        let pos = state.hrt_position(self.key)?;
        Some(f(&mut state.hrt[pos]))
    }

    pub fn contract(&self) -> QosContract {
        self.with_entry(|e| e.contract).unwrap_or_default()
    }

    /// First violation handled by the recovery handler since the last
    /// [`clear_violation`](Self::clear_violation).
    pub fn violation(&self) -> Option<BusError> {
        self.with_entry(|e| e.violation.clone()).flatten()
    }

    /// Re-enable the recovery handler.
    pub fn clear_violation(&self) {
        self.with_entry(|e| e.violation = None);
    }

    /// When the deadline/jitter timer fires if nothing is consumed.
    pub fn qos_deadline(&self) -> Option<Timestamp> {
        self.with_entry(|e| e.timer.deadline()).flatten()
    }

    /// Accepted `(min, max)` latency once jitter monitoring has samples.
    pub fn latency_window(&self) -> Option<(Duration, Duration)> {
        self.with_entry(|e| e.window.bounds()).flatten()
    }

    /// Leave the topic.  Unread messages no longer wait for this subscriber.
    pub fn unsubscribe(self) {}

    /// Account for consuming slot `idx` with `latency`: move the deadline
    /// timer and check jitter.
    fn consume(
        &self,
        inner: &Arc<TopicInner>,
        state: &mut TopicState,
        idx: usize,
        latency: Duration,
    ) -> (Option<BusError>, Escalation) {
        let Some(pos) = state.hrt_position(self.key) else {
            return (None, Escalation::None);
        };
        let next_pending = (idx != state.latest).then(|| oldest_pending(state, inner.order, idx));

        let entry = &mut state.hrt[pos];
        if let Some(mark) = entry.mark {
            let consumed = mark.slot == idx || state.slots[mark.slot].id != mark.id;
            if consumed {
                match next_pending {
                    Some(next) => {
                        let slot = &state.slots[next];
                        let mark = QosMark {
                            slot: next,
                            id: slot.id,
                            time: slot.time,
                        };
                        if !inner.arm_deadline(entry, mark) {
                            entry.disarm();
                        }
                    }
                    None => entry.disarm(),
                }
            }
        }

        let (_, jitter) = inner.monitored(&entry.contract);
        match jitter {
            Some(jitter) if !entry.window.record(latency, jitter) => {
                let violation = BusError::JitterViolation;
                let escalation = entry.recovery.escalate(&mut entry.violation, violation.clone());
                (Some(violation), escalation)
            }
            _ => (None, Escalation::None),
        }
    }
}

/// Pending message after `idx` with the oldest information.
fn oldest_pending(state: &TopicState, order: MessageOrder, idx: usize) -> usize {
    let next = state.slots[idx].next;
    match order {
        MessageOrder::MsgTime => next,
        MessageOrder::PubTime => state
            .chain(next)
            .into_iter()
            .min_by_key(|&i| state.slots[i].time)
            .unwrap_or(next),
    }
}

/// Drop one mandatory consumer from `slot`.  Returns `true` if it was the last.
fn release_slot(state: &mut TopicState, idx: usize) -> bool {
    let slot = &mut state.slots[idx];
    slot.consumers_left = slot.consumers_left.saturating_sub(1);
    if slot.hrt_left == 0 {
        return false;
    }
    slot.hrt_left -= 1;
    slot.hrt_left == 0
}

impl Subscriber for HrtSubscriber {
    fn class(&self) -> RtClass {
        RtClass::Hrt
    }

    fn topic(&self) -> &Topic {
        &self.reader.topic
    }

    fn listener(&self) -> &EventListener {
        &self.reader.listener
    }

    fn fetch_next(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        let inner = self.reader.inner();
        let mut guard = inner.state.lock();
        let idx = guard
            .resume_from(self.reader.last, self.reader.last_id)
            .ok_or(BusError::FetchNoMessage)?;
        let (size, time) = self.reader.take(&guard, idx, buf)?;
        let latency = inner.core.now().saturating_duration_since(time);

        let state = &mut *guard;
        let released = release_slot(state, idx);
        let (violation, escalation) = self.consume(&inner, state, idx, latency);
        if released {
            inner.released.notify_all();
        }
        drop(guard);

        escalation.run(&inner.core);
        self.reader.track(1, latency);
        Ok(Fetched {
            size,
            time,
            latency,
            violation,
        })
    }

    fn fetch_latest(&mut self, buf: &mut [u8]) -> BusResult<Fetched> {
        let inner = self.reader.inner();
        let mut guard = inner.state.lock();
        let start = guard
            .resume_from(self.reader.last, self.reader.last_id)
            .ok_or(BusError::FetchNoMessage)?;
        let latest = guard.latest;
        let (size, time) = self.reader.take(&guard, latest, buf)?;
        let now = inner.core.now();

        let state = &mut *guard;
        let pending = state.chain(start);
        let mut released = false;
        let mut violation = None;
        let mut escalation = Escalation::None;
        for &idx in &pending {
            released |= release_slot(state, idx);
            let latency = now.saturating_duration_since(state.slots[idx].time);
            let (found, raised) = self.consume(&inner, state, idx, latency);
            // Only the first violation is reported and escalated.
            if violation.is_none() && found.is_some() {
                violation = found;
                escalation = raised;
            }
        }
        if released {
            inner.released.notify_all();
        }
        drop(guard);

        let latency = now.saturating_duration_since(time);
        escalation.run(&inner.core);
        self.reader.track(pending.len(), latency);
        Ok(Fetched {
            size,
            time,
            latency,
            violation,
        })
    }

    fn stats(&self) -> SubscriberStats {
        self.reader.stats(RtClass::Hrt)
    }
}

impl Drop for HrtSubscriber {
    fn drop(&mut self) {
        let inner = self.reader.inner();
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        if let Some(pos) = state.hrt_position(self.key) {
            let mut entry = state.hrt.remove(pos);
            entry.disarm();
            if pos == 0 {
                inner.arm_rate_timer(state, 0);
            }
        }
        let mut released = false;
        if let Some(start) = state.resume_from(self.reader.last, self.reader.last_id) {
            for idx in state.chain(start) {
                released |= release_slot(state, idx);
            }
        }
        state.subscribers = state.subscribers.saturating_sub(1);
        if released {
            inner.released.notify_all();
        }
        drop(guard);
        debug!(topic = inner.id, subscriber = self.key, "hard real-time subscriber left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::publisher::Publisher;
    use parking_lot::Mutex;
    use rtbus_kernel::ManualClock;
    use rtbus_types::{BusConfig, PublishPolicy};

    struct Bench {
        clock: Arc<ManualClock>,
        core: Arc<Core>,
        topic: Topic,
        publisher: Publisher,
    }

    fn bench(capacity: usize) -> Bench {
        let clock = Arc::new(ManualClock::default());
        let core = Core::new(BusConfig::default(), clock.clone());
        let topic = Topic::new(&core, 1, capacity, 1).unwrap();
        let publisher = Publisher::new(&topic);
        Bench {
            clock,
            core,
            topic,
            publisher,
        }
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    impl Bench {
        fn publish(&self, value: u8, t: u64) {
            self.publisher
                .publish(&[value], ms(t), PublishPolicy::Enforcing, None)
                .unwrap();
        }

        fn fire(&self, t: u64) -> usize {
            self.clock.set(ms(t));
            self.core.timers().fire_due(ms(t))
        }
    }

    fn recorder() -> (Recovery, Arc<Mutex<Vec<BusError>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Recovery::handler(move |v| sink.lock().push(v)), seen)
    }

    #[test]
    fn fetch_next_reads_in_order_then_reports_no_message() {
        let b = bench(4);
        let mut sub = NrtSubscriber::subscribe(&b.topic, 1);
        let mut buf = [0u8; 1];
        assert_eq!(sub.fetch_next(&mut buf), Err(BusError::FetchNoMessage));

        b.publish(1, 1);
        b.publish(2, 2);
        assert_eq!(sub.fetch_next(&mut buf).unwrap().time, ms(1));
        assert_eq!(buf[0], 1);
        assert_eq!(sub.fetch_next(&mut buf).unwrap().time, ms(2));
        assert_eq!(buf[0], 2);
        assert_eq!(sub.fetch_next(&mut buf), Err(BusError::FetchNoMessage));
        assert_eq!(sub.stats().received, 2);
    }

    #[test]
    fn subscriber_only_sees_messages_after_subscribing() {
        let b = bench(4);
        b.publish(1, 1);
        let mut sub = NrtSubscriber::subscribe(&b.topic, 1);
        let mut buf = [0u8; 1];
        assert_eq!(sub.fetch_next(&mut buf), Err(BusError::FetchNoMessage));
        b.publish(2, 2);
        sub.fetch_next(&mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn lagging_subscriber_resumes_at_oldest() {
        let b = bench(3);
        let mut sub = NrtSubscriber::subscribe(&b.topic, 1);
        let mut buf = [0u8; 1];
        b.publish(1, 1);
        sub.fetch_next(&mut buf).unwrap();
        for t in 2..=6 {
            b.publish(t as u8, t);
        }
        sub.fetch_next(&mut buf).unwrap();
        assert_eq!(buf[0], 4);
        assert_eq!(b.topic.stats().discarded, 2);
    }

    #[test]
    fn fetch_latest_skips_to_newest() {
        let b = bench(4);
        let mut sub = NrtSubscriber::subscribe(&b.topic, 1);
        let mut buf = [0u8; 1];
        for t in 1..=3 {
            b.publish(t as u8, t);
        }
        let fetched = sub.fetch_latest(&mut buf).unwrap();
        assert_eq!((buf[0], fetched.time), (3, ms(3)));
        assert_eq!(sub.fetch_latest(&mut buf), Err(BusError::FetchNoMessage));
        assert_eq!(sub.fetch_next(&mut buf), Err(BusError::FetchNoMessage));
        assert_eq!(sub.stats().received, 3);
    }

    #[test]
    fn small_buffer_is_rejected_without_consuming() {
        let b = bench(2);
        let mut sub = NrtSubscriber::subscribe(&b.topic, 1);
        b.publish(9, 1);
        let mut empty: [u8; 0] = [];
        assert_eq!(
            sub.fetch_next(&mut empty),
            Err(BusError::PayloadTooLarge { size: 1, capacity: 0 })
        );
        let mut buf = [0u8; 1];
        sub.fetch_next(&mut buf).unwrap();
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn srt_usefulness_is_clamped() {
        let b = bench(2);
        let sub = SrtSubscriber::subscribe(&b.topic, 1, |latency| {
            1.5 - latency.as_millis() as f32 / 10.0
        });
        assert_eq!(sub.usefulness(Duration::ZERO), 1.0);
        assert_eq!(sub.usefulness(Duration::from_millis(10)), 0.5);
        assert_eq!(sub.usefulness(Duration::from_millis(100)), 0.0);
        assert_eq!(sub.class(), RtClass::Srt);
    }

    #[test]
    fn frt_reports_deadline_and_jitter_violations() {
        let b = bench(4);
        let mut sub = FrtSubscriber::subscribe(
            &b.topic,
            1,
            Some(Duration::from_millis(50)),
            Some(Duration::from_millis(5)),
        );
        let mut buf = [0u8; 1];

        b.publish(1, 0);
        b.clock.set(ms(10));
        assert_eq!(sub.fetch_next(&mut buf).unwrap().violation, None);

        b.publish(2, 10);
        b.clock.set(ms(40));
        assert_eq!(
            sub.fetch_next(&mut buf).unwrap().violation,
            Some(BusError::JitterViolation)
        );

        b.publish(3, 40);
        b.clock.set(ms(100));
        assert_eq!(
            sub.fetch_next(&mut buf).unwrap().violation,
            Some(BusError::DeadlineViolation)
        );

        assert!(sub.calculate_validity(Duration::from_millis(12)));
        assert!(!sub.calculate_validity(Duration::from_millis(20)));
        assert!(!sub.calculate_validity(Duration::from_millis(60)));
    }

    #[test]
    fn hrt_fetch_releases_slot_for_blocking_publish() {
        let b = bench(1);
        let mut sub = HrtSubscriber::subscribe(&b.topic, 1, QosContract::default(), Recovery::Panic);
        let mut buf = [0u8; 1];
        b.publisher.publish(&[1], ms(1), PublishPolicy::Blocking, None).unwrap();
        assert_eq!(
            b.publisher.publish(&[2], ms(2), PublishPolicy::Blocking, None),
            Err(BusError::PublishBlocked)
        );
        sub.fetch_next(&mut buf).unwrap();
        b.publisher.publish(&[2], ms(2), PublishPolicy::Blocking, None).unwrap();
    }

    #[test]
    fn deadline_timer_moves_to_next_pending_message() {
        let b = bench(4);
        let mut sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_deadline(Duration::from_millis(100)),
            Recovery::Panic,
        );
        let mut buf = [0u8; 1];
        b.publish(1, 0);
        b.publish(2, 30);
        assert_eq!(sub.qos_deadline(), Some(ms(100)));

        sub.fetch_next(&mut buf).unwrap();
        assert_eq!(sub.qos_deadline(), Some(ms(130)));
        sub.fetch_next(&mut buf).unwrap();
        assert_eq!(sub.qos_deadline(), None);
    }

    #[test]
    fn missed_deadline_runs_recovery_once() {
        let b = bench(4);
        let (recovery, seen) = recorder();
        let sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_deadline(Duration::from_millis(100)),
            recovery,
        );
        b.publish(1, 0);
        assert_eq!(b.fire(99), 0);
        assert_eq!(b.fire(150), 1);

        assert_eq!(*seen.lock(), vec![BusError::DeadlineViolation]);
        assert_eq!(sub.violation(), Some(BusError::DeadlineViolation));
        assert_eq!(b.core.status(), Ok(()));

        sub.clear_violation();
        assert_eq!(sub.violation(), None);
    }

    #[test]
    fn missed_deadline_without_recovery_panics_core() {
        let b = bench(4);
        let _sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_deadline(Duration::from_millis(10)),
            Recovery::Panic,
        );
        b.publish(1, 0);
        b.fire(20);
        assert_eq!(b.core.status(), Err(BusError::DeadlineViolation));
    }

    #[test]
    fn hrt_jitter_violation_escalates() {
        let b = bench(4);
        let (recovery, seen) = recorder();
        let mut sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_jitter(Duration::from_millis(5)),
            recovery,
        );
        let mut buf = [0u8; 1];
        b.publish(1, 0);
        b.clock.set(ms(10));
        assert_eq!(sub.fetch_next(&mut buf).unwrap().violation, None);
        assert_eq!(sub.latency_window(), Some((Duration::from_millis(10), Duration::from_millis(10))));

        b.publish(2, 10);
        b.clock.set(ms(40));
        assert_eq!(
            sub.fetch_next(&mut buf).unwrap().violation,
            Some(BusError::JitterViolation)
        );
        assert_eq!(*seen.lock(), vec![BusError::JitterViolation]);
    }

    #[test]
    fn rate_timer_hands_over_to_next_subscriber() {
        let b = bench(4);
        let (fast_recovery, fast_seen) = recorder();
        let (slow_recovery, slow_seen) = recorder();
        let _slow = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_rate(Duration::from_millis(20)),
            slow_recovery,
        );
        let _fast = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_rate(Duration::from_millis(10)),
            fast_recovery,
        );

        b.publish(1, 0);
        assert_eq!(b.topic.rate_deadline(), Some(ms(10)));

        b.fire(10);
        assert_eq!(*fast_seen.lock(), vec![BusError::RateViolation]);
        assert_eq!(b.topic.rate_deadline(), Some(ms(20)));

        b.fire(20);
        assert_eq!(*slow_seen.lock(), vec![BusError::RateViolation]);
        assert_eq!(b.topic.rate_deadline(), None);
    }

    #[test]
    fn fresh_publish_rearms_rate_timer() {
        let b = bench(4);
        let _sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_rate(Duration::from_millis(10)),
            Recovery::Panic,
        );
        b.publish(1, 0);
        b.publish(2, 8);
        assert_eq!(b.topic.rate_deadline(), Some(ms(18)));
        b.fire(15);
        assert_eq!(b.core.status(), Ok(()));
    }

    #[test]
    fn unsubscribe_releases_pending_messages() {
        let b = bench(2);
        let sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_rate(Duration::from_millis(10)),
            Recovery::Panic,
        );
        b.publish(1, 1);
        b.publish(2, 2);
        assert_eq!(
            b.publisher.publish(&[3], ms(3), PublishPolicy::Lazy, None),
            Err(BusError::PublishBlocked)
        );
        assert!(b.topic.rate_deadline().is_some());

        sub.unsubscribe();
        assert_eq!(b.topic.hrt_subscriber_count(), 0);
        assert_eq!(b.topic.rate_deadline(), None);
        assert_eq!(b.topic.stats().subscribers, 0);
        b.publisher.publish(&[3], ms(3), PublishPolicy::Lazy, None).unwrap();
    }

    #[test]
    fn hrt_fetch_latest_consumes_everything_pending() {
        let b = bench(3);
        let mut sub = HrtSubscriber::subscribe(
            &b.topic,
            1,
            QosContract::default().with_deadline(Duration::from_millis(100)),
            Recovery::Panic,
        );
        let mut buf = [0u8; 1];
        for t in 1..=3 {
            b.publish(t as u8, t);
        }
        sub.fetch_latest(&mut buf).unwrap();
        assert_eq!(buf[0], 3);
        assert_eq!(sub.qos_deadline(), None);
        for t in 4..=6 {
            b.publisher
                .publish(&[t as u8], ms(t), PublishPolicy::Lazy, None)
                .unwrap();
        }
    }
}
